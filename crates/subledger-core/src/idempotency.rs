use uuid::Uuid;

use crate::types::User;

/// Builds the Exchange-facing idempotency key for a user-initiated
/// withdrawal: a fresh UUID with its first hyphen-delimited segment replaced
/// by the first segment of the user's id.
///
/// The result stays UUID-shaped (the Exchange requires that) while letting
/// the reconciler recover the owning user later by prefix. Two users sharing
/// the same first 8 hex characters would collide; destination-address
/// matching takes precedence at reconcile time, which keeps this a fallback
/// rather than the whole answer.
pub fn generate_key(user_id: &str) -> String {
    let user_prefix = user_id.split('-').next().unwrap_or(user_id);
    let fresh = Uuid::new_v4().to_string();
    let tail = match fresh.split_once('-') {
        Some((_, rest)) => rest.to_string(),
        None => fresh,
    };
    format!("{user_prefix}-{tail}")
}

/// Returns the first hyphen-delimited segment of an idempotency key, or
/// `None` for an empty key.
pub fn key_prefix(key: &str) -> Option<&str> {
    if key.is_empty() {
        return None;
    }
    key.split('-').next()
}

/// Finds the user whose id starts with the same first segment as the given
/// idempotency key.
pub fn match_user_by_prefix<'a>(key: &str, users: &'a [User]) -> Option<&'a User> {
    let prefix = key_prefix(key)?;
    users
        .iter()
        .find(|u| u.id.split('-').next() == Some(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            name: "Test".to_string(),
            email: format!("{id}@example.com"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn generated_key_carries_user_prefix_and_stays_uuid_shaped() {
        let user_id = "a1b2c3d4-1111-2222-3333-444455556666";
        let key = generate_key(user_id);

        let segments: Vec<&str> = key.split('-').collect();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0], "a1b2c3d4");
        assert_eq!(segments[1].len(), 4);
        assert_eq!(segments[2].len(), 4);
        assert_eq!(segments[3].len(), 4);
        assert_eq!(segments[4].len(), 12);
    }

    #[test]
    fn two_keys_for_one_user_differ() {
        let user_id = "a1b2c3d4-1111-2222-3333-444455556666";
        assert_ne!(generate_key(user_id), generate_key(user_id));
    }

    #[test]
    fn prefix_match_recovers_user() {
        let users = vec![
            user("a1b2c3d4-1111-2222-3333-444455556666"),
            user("deadbeef-1111-2222-3333-444455556666"),
        ];

        let key = generate_key(&users[1].id);
        let matched = match_user_by_prefix(&key, &users).unwrap();
        assert_eq!(matched.id, users[1].id);

        assert!(match_user_by_prefix("ffffffff-0000", &users).is_none());
        assert!(match_user_by_prefix("", &users).is_none());
    }
}
