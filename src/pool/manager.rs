//! Pluggable connection lifecycle capability.

use async_trait::async_trait;

/// Describes how to create, validate and recycle one kind of connection.
///
/// The pool assumes nothing about the connection type beyond this trait.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection.
    async fn create(&self) -> Result<Self::Connection, Self::Error>;

    /// Check that a connection is still usable.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<bool, Self::Error>;

    /// Reset a released connection before it is reused.
    async fn recycle(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        Ok(conn)
    }
}
