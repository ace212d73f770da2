use crate::{CancellationToken, Deferred, Error, Provider};

/// ScalarFuture is the deferred result of a query returning a single value,
/// such as a count or sum. An empty result reads as `T::default()`.
pub struct ScalarFuture<P: Provider, T> {
    inner: Deferred<P, T>,
}

impl<P, T> ScalarFuture<P, T>
where
    P: Provider,
    T: Clone + Default + Send + Sync + 'static,
{
    pub(crate) fn new(inner: Deferred<P, T>) -> Self {
        Self { inner }
    }

    pub fn has_value(&self) -> bool {
        self.inner.has_value()
    }

    pub fn deferred(&self) -> &Deferred<P, T> {
        &self.inner
    }

    /// Value of this future, executing its batch if needed.
    pub fn value(&self) -> Result<T, Error> {
        Ok(self.inner.materialize()?.cloned().unwrap_or_default())
    }

    pub async fn value_async(&self, cancel: &CancellationToken) -> Result<T, Error> {
        Ok(self
            .inner
            .materialize_async(cancel)
            .await?
            .cloned()
            .unwrap_or_default())
    }

    /// Execute only this future's query, bypassing its batch.
    pub fn get_result_directly(&self) -> Result<T, Error> {
        self.inner.get_result_directly().cloned()
    }

    pub async fn get_result_directly_async(&self, cancel: &CancellationToken) -> Result<T, Error> {
        self.inner.get_result_directly_async(cancel).await.cloned()
    }
}
