use async_trait::async_trait;

use crate::error::FirestoreResult;

/// Supplies auth tokens for stream opens. Implementations cache tokens;
/// `invalidate_token` drops the cache after an `Unauthenticated` close so
/// the next attempt fetches a fresh one.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;
    fn invalidate_token(&self);
}

/// Credentials for unauthenticated use (emulators, tests).
#[derive(Default)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}
