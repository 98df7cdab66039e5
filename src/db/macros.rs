/// A macro to simplify read-through caching.
///
/// This macro checks if a value is present in the cache.
/// If found, it returns the cached value.
/// If not found, it executes the provided block to compute the value,
/// stores it in the cache in the background, and then returns the computed value.
///
/// # Arguments
/// * `$cache`: The [`Cache`](crate::db::Cache) to read from and write to.
/// * `$key`: The [`CacheKey`](crate::db::CacheKey); its tier supplies the default TTL.
/// * `$block`: A future producing `AppResult<T>`, awaited only on a miss.
///
/// # Example
/// ```rust,ignore
/// let features = cached!(self.cache, CacheKey::AudioFeatures(id), async move {
///     self.fetch_features(&id).await
/// });
/// ```
#[macro_export]
macro_rules! cached {
    ($cache:expr, $key:expr, $block:expr) => {{
        let key = $key;
        if let Some(cached) = $cache.get_from_cache(&key).await {
            Ok(cached)
        } else {
            let value = $block.await?;
            $cache.set_in_background(&key, &value);
            Ok(value)
        }
    }};
}
