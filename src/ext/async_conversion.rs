/// Async counterpart to `TryFrom<T>`, for conversions that need I/O.
///
/// ```rust,ignore
/// let fingerprint = TreeFingerprint::async_try_from(root).await?;
/// ```
pub trait AsyncTryFrom<T>: Sized {
    type Error;

    async fn async_try_from(value: T) -> Result<Self, Self::Error>;
}
