use uuid::Uuid;

/// Key-naming helpers for the shared-state store, following the
/// `category:identifier` convention from the retrieval pack's Redis client
/// (`blacklist:token:{jti}`, `refresh:{user_id}:{token_id}`, etc).
pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn user_sessions(user_id: Uuid) -> String {
    format!("user:sessions:{user_id}")
}

pub fn blacklist(jti: &str) -> String {
    format!("blacklist:{jti}")
}

pub fn directory_email(email: &str) -> String {
    format!("directory:email:{}", email.to_lowercase())
}

pub fn directory_username(username: &str) -> String {
    format!("directory:username:{}", username.to_lowercase())
}

pub fn presence(user_id: Uuid) -> String {
    format!("presence:{user_id}")
}

pub fn failed_login(identifier: &str) -> String {
    format!("failed_login:{}", identifier.to_lowercase())
}

pub fn account_lock(identifier: &str) -> String {
    format!("account_lock:{}", identifier.to_lowercase())
}

pub fn rate_limit(bucket: &str, identifier: &str) -> String {
    format!("ratelimit:{bucket}:{identifier}")
}

pub fn chat_channel(conversation_id: Uuid) -> String {
    format!("chat:{conversation_id}")
}

pub fn call_channel(call_id: Uuid) -> String {
    format!("call:{call_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_keys_are_case_insensitive() {
        let id = Uuid::nil();
        assert_eq!(directory_email("User@Example.com"), directory_email("user@example.com"));
        assert_eq!(presence(id), format!("presence:{id}"));
    }

    #[test]
    fn key_prefixes_match_naming_convention() {
        assert!(blacklist("abc").starts_with("blacklist:"));
        assert!(failed_login("x").starts_with("failed_login:"));
        assert!(rate_limit("login", "1.2.3.4").starts_with("ratelimit:login:"));
    }
}
