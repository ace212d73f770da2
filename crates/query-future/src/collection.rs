use crate::{CancellationToken, Deferred, Error, Provider};

/// CollectionFuture is the deferred result of a query returning rows of `T`.
///
/// Rows are fully read into an owned list when the future's batch executes.
/// After that, every accessor reads from the same list and no further
/// queries are issued.
pub struct CollectionFuture<P: Provider, T> {
    inner: Deferred<P, Vec<T>>,
}

impl<P, T> CollectionFuture<P, T>
where
    P: Provider,
    T: Send + Sync + 'static,
{
    pub(crate) fn new(inner: Deferred<P, Vec<T>>) -> Self {
        Self { inner }
    }

    pub fn has_value(&self) -> bool {
        self.inner.has_value()
    }

    /// Deferred handle of this future.
    pub fn deferred(&self) -> &Deferred<P, Vec<T>> {
        &self.inner
    }

    /// Materialize this future, executing its batch if needed,
    /// and return its rows.
    pub fn materialize(&self) -> Result<&[T], Error> {
        Ok(as_slice(self.inner.materialize()?))
    }

    /// Asynchronously materialize this future, and return its rows.
    pub async fn materialize_async(&self, cancel: &CancellationToken) -> Result<&[T], Error> {
        Ok(as_slice(self.inner.materialize_async(cancel).await?))
    }

    /// Execute only this future's query, bypassing its batch.
    pub fn get_result_directly(&self) -> Result<&[T], Error> {
        Ok(self.inner.get_result_directly()?.as_slice())
    }

    pub async fn get_result_directly_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<&[T], Error> {
        Ok(self
            .inner
            .get_result_directly_async(cancel)
            .await?
            .as_slice())
    }

    /// Iterate over the materialized rows. The iterator may be re-created
    /// any number of times and always yields the same rows.
    pub fn iter(&self) -> Result<std::slice::Iter<'_, T>, Error> {
        Ok(self.materialize()?.iter())
    }
}

impl<P, T> CollectionFuture<P, T>
where
    P: Provider,
    T: Clone + Send + Sync + 'static,
{
    pub fn to_list(&self) -> Result<Vec<T>, Error> {
        Ok(self.materialize()?.to_vec())
    }

    pub fn to_array(&self) -> Result<Box<[T]>, Error> {
        Ok(self.materialize()?.into())
    }

    pub async fn to_list_async(&self, cancel: &CancellationToken) -> Result<Vec<T>, Error> {
        Ok(self.materialize_async(cancel).await?.to_vec())
    }

    pub async fn to_array_async(&self, cancel: &CancellationToken) -> Result<Box<[T]>, Error> {
        Ok(self.materialize_async(cancel).await?.into())
    }
}

impl<P, T> CollectionFuture<P, T>
where
    P: Provider,
    T: Clone + Default + Send + Sync + 'static,
{
    /// First row, or `T::default()` if there are no rows.
    pub fn first_or_default(&self) -> Result<T, Error> {
        Ok(self.materialize()?.first().cloned().unwrap_or_default())
    }

    pub async fn first_or_default_async(&self, cancel: &CancellationToken) -> Result<T, Error> {
        Ok(self
            .materialize_async(cancel)
            .await?
            .first()
            .cloned()
            .unwrap_or_default())
    }
}

// A successfully executed batch which produced no rows for this future
// (its query couldn't run) reads as empty.
fn as_slice<T>(value: Option<&Vec<T>>) -> &[T] {
    value.map(Vec::as_slice).unwrap_or_default()
}
