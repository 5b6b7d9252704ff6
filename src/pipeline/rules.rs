//! Sender blocklist: glob patterns over email addresses, stored per
//! inbound account.
//!
//! `*` matches any run of characters (including none); every other character
//! matches itself. Matching is case-insensitive and anchored at both ends.

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::DatabaseError;
use crate::store::Database;

/// Minimum length of a stored pattern.
pub const MIN_PATTERN_LEN: usize = 6;

/// Compile a blocklist glob into an anchored, case-insensitive regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .build()
}

/// Whether `address` matches the glob `pattern`.
pub fn glob_matches(pattern: &str, address: &str) -> bool {
    glob_to_regex(pattern.trim()).is_ok_and(|re| re.is_match(address.trim()))
}

/// Patterns must look like an address: contain `@` and `.`, and be at
/// least [`MIN_PATTERN_LEN`] characters long.
pub fn is_valid_pattern(pattern: &str) -> bool {
    pattern.contains('@') && pattern.contains('.') && pattern.chars().count() >= MIN_PATTERN_LEN
}

/// Blocklist operations backed by the store.
#[derive(Clone)]
pub struct BlocklistFilter {
    db: Arc<dyn Database>,
}

impl BlocklistFilter {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Whether `address` matches any pattern stored for `account_id`.
    pub async fn is_blocked(&self, account_id: i64, address: &str) -> Result<bool, DatabaseError> {
        Ok(self.first_match(account_id, &[address]).await?.is_some())
    }

    /// The first pattern that matches one of `addresses`, if any.
    pub async fn first_match<S: AsRef<str>>(
        &self,
        account_id: i64,
        addresses: &[S],
    ) -> Result<Option<String>, DatabaseError> {
        if addresses.is_empty() {
            return Ok(None);
        }
        let patterns = self.db.list_blocklist(account_id).await?;
        for pattern in patterns {
            let Ok(re) = glob_to_regex(&pattern) else {
                continue;
            };
            if let Some(addr) = addresses.iter().find(|a| re.is_match(a.as_ref().trim())) {
                debug!(
                    account_id,
                    pattern = %pattern,
                    address = %addr.as_ref(),
                    "Sender matched blocklist"
                );
                return Ok(Some(pattern));
            }
        }
        Ok(None)
    }

    /// Returns false if the pattern was already present.
    pub async fn add(&self, account_id: i64, pattern: &str) -> Result<bool, DatabaseError> {
        self.db.add_blocklist_entry(account_id, pattern.trim()).await
    }

    /// Returns false if the pattern was not present.
    pub async fn remove(&self, account_id: i64, pattern: &str) -> Result<bool, DatabaseError> {
        self.db.remove_blocklist_entry(account_id, pattern.trim()).await
    }

    pub async fn clear(&self, account_id: i64) -> Result<u64, DatabaseError> {
        self.db.clear_blocklist(account_id).await
    }

    pub async fn list(&self, account_id: i64) -> Result<Vec<String>, DatabaseError> {
        self.db.list_blocklist(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, NewInboundAccount};
    use secrecy::SecretString;

    #[test]
    fn wildcard_local_part() {
        assert!(glob_matches("*@evil.com", "anything@evil.com"));
        assert!(glob_matches("*@evil.com", "a.b@evil.com"));
        assert!(!glob_matches("*@evil.com", "evil.com@good.com"));
    }

    #[test]
    fn wildcard_matches_empty_run() {
        assert!(glob_matches("boss*@work.com", "boss@work.com"));
        assert!(glob_matches("*boss@work.com", "boss@work.com"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(glob_matches("*@Evil.COM", "Someone@evil.com"));
    }

    #[test]
    fn dots_match_literally() {
        assert!(!glob_matches("*@evil.com", "x@evilxcom"));
        assert!(!glob_matches("a+b@x.com", "aab@x.com"));
        assert!(glob_matches("a+b@x.com", "a+b@x.com"));
    }

    #[test]
    fn exact_pattern_is_anchored() {
        assert!(glob_matches("bob@example.com", "bob@example.com"));
        assert!(!glob_matches("bob@example.com", "bob@example.com.evil.org"));
        assert!(!glob_matches("bob@example.com", "xbob@example.com"));
    }

    #[test]
    fn multiple_wildcards() {
        assert!(glob_matches("*@*.spam.*", "x@mail.spam.net"));
        assert!(!glob_matches("*@*.spam.*", "x@spam.net"));
    }

    #[test]
    fn pattern_validation() {
        assert!(is_valid_pattern("*@a.de"));
        assert!(!is_valid_pattern("*@a.d"));
        assert!(!is_valid_pattern("nobody.example"));
        assert!(!is_valid_pattern("nobody@example"));
    }

    async fn filter_with_account() -> (BlocklistFilter, i64) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let room = db.ensure_room("!r:example.com", 30, false).await.unwrap();
        let account = db
            .insert_inbound_account(
                room.id,
                &NewInboundAccount {
                    host: "imap.example.com".into(),
                    port: 993,
                    username: "me@example.com".into(),
                    password: SecretString::from("pw".to_string()),
                    mailbox: "INBOX".into(),
                    ignore_cert: false,
                },
            )
            .await
            .unwrap();
        (BlocklistFilter::new(db), account)
    }

    #[tokio::test]
    async fn blocked_if_any_address_matches() {
        let (filter, account) = filter_with_account().await;
        filter.add(account, "*@spam.com").await.unwrap();

        assert!(filter.is_blocked(account, "x@spam.com").await.unwrap());
        assert!(!filter.is_blocked(account, "x@ham.com").await.unwrap());

        let hit = filter
            .first_match(account, &["friend@ham.com", "relay@SPAM.com"])
            .await
            .unwrap();
        assert_eq!(hit.as_deref(), Some("*@spam.com"));
    }

    #[tokio::test]
    async fn list_keeps_insertion_order_and_clear_empties() {
        let (filter, account) = filter_with_account().await;
        filter.add(account, "z@last.com").await.unwrap();
        filter.add(account, "a@first.com").await.unwrap();
        assert_eq!(
            filter.list(account).await.unwrap(),
            vec!["z@last.com".to_string(), "a@first.com".to_string()]
        );

        assert!(filter.remove(account, "z@last.com").await.unwrap());
        assert_eq!(filter.clear(account).await.unwrap(), 1);
        assert!(!filter.is_blocked(account, "a@first.com").await.unwrap());
    }

    #[tokio::test]
    async fn empty_address_list_is_never_blocked() {
        let (filter, account) = filter_with_account().await;
        filter.add(account, "*@*.com").await.unwrap();
        let none: [&str; 0] = [];
        assert!(filter.first_match(account, &none).await.unwrap().is_none());
    }
}
