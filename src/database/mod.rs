//! Database seam: the upstream query executor and paged, cached result building.
//!
//! The cache never talks to the database itself. Handlers supply a [`QueryExecutor`]
//! (built over whatever driver and SQL layer they use), and [`CachedQueries`] runs it
//! through the [`QueryCache`] so that identical page requests hit the database once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::cache::{BoxError, CacheError, QueryCache};
use crate::key::{DEFAULT_LIMIT, DEFAULT_PAGE, Pagination};

/// One result row, as a JSON object.
pub type Row = Map<String, Value>;

/// Column a query may add to its first row to report the total number of matches.
pub const FOUND_COLUMN: &str = "found";

/// A paged read request handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub endpoint: String,
    /// Query parameters as received, already validated upstream.
    pub params: HashMap<String, String>,
    pub page: Pagination,
}

impl PageRequest {
    pub fn new(endpoint: impl Into<String>, params: HashMap<String, String>) -> Self {
        let page = Pagination {
            page: positive_param(&params, "page").unwrap_or(DEFAULT_PAGE),
            limit: positive_param(&params, "limit").unwrap_or(DEFAULT_LIMIT),
        };
        Self {
            endpoint: endpoint.into(),
            params,
            page,
        }
    }

    /// Row offset of the requested page.
    pub fn offset(&self) -> u64 {
        self.page.offset()
    }
}

fn positive_param(params: &HashMap<String, String>, name: &str) -> Option<u32> {
    params
        .get(name)
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|n| *n > 0)
}

/// Runs read queries against the backing store.
pub trait QueryExecutor: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetches the rows of one page: `request.page.limit` rows starting at
    /// `request.offset()`.
    fn fetch_rows(
        &self,
        request: &PageRequest,
    ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send;
}

/// Total match count reported in a page's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Found {
    Exact(u64),
    /// A full page came back and no total was reported; serialized as `">limit"`.
    MoreThan(u32),
}

impl Found {
    /// Derives the count from a page of rows.
    pub fn from_rows(rows: &[Row], limit: u32) -> Self {
        if let Some(total) = rows
            .first()
            .and_then(|row| row.get(FOUND_COLUMN))
            .and_then(Value::as_u64)
        {
            return Self::Exact(total);
        }
        if !rows.is_empty() && rows.len() == limit as usize {
            return Self::MoreThan(limit);
        }
        Self::Exact(rows.len() as u64)
    }
}

impl Serialize for Found {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Exact(n) => serializer.serialize_u64(*n),
            Self::MoreThan(limit) => serializer.serialize_str(&format!(">{limit}")),
        }
    }
}

/// Page metadata returned alongside results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub name: &'static str,
    pub website: String,
    pub page: u32,
    pub limit: u32,
    pub found: Found,
}

/// A serialized page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPage {
    pub meta: Meta,
    pub results: Vec<Row>,
}

impl ResultPage {
    pub fn new(website: impl Into<String>, page: Pagination, rows: Vec<Row>) -> Self {
        Self {
            meta: Meta {
                name: "openaq-api",
                website: website.into(),
                page: page.page,
                limit: page.limit,
                found: Found::from_rows(&rows, page.limit),
            },
            results: rows,
        }
    }
}

/// A [`QueryExecutor`] served through a shared [`QueryCache`].
pub struct CachedQueries<E> {
    executor: Arc<E>,
    cache: Arc<QueryCache>,
    website: String,
}

impl<E: QueryExecutor> CachedQueries<E> {
    pub fn new(executor: Arc<E>, cache: Arc<QueryCache>) -> Self {
        Self {
            executor,
            cache,
            website: "/".to_owned(),
        }
    }

    /// Sets the `website` reported in page metadata.
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = website.into();
        self
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Fetches one page of `endpoint` results as a JSON document, from the cache when
    /// possible.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Upstream`] wrapping the executor's error (or a
    /// serialization error) when the query fails.
    pub async fn fetch_page(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
    ) -> Result<Bytes, CacheError> {
        let request = PageRequest::new(endpoint, params.clone());
        let executor = Arc::clone(&self.executor);
        let website = self.website.clone();

        self.cache
            .fetch(endpoint, params, move || async move {
                let rows = executor
                    .fetch_rows(&request)
                    .await
                    .map_err(BoxError::from)?;
                let page = ResultPage::new(website, request.page, rows);
                let body = serde_json::to_vec(&page).map_err(BoxError::from)?;
                Ok::<_, BoxError>(Bytes::from(body))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::config::CacheSettings;

    #[derive(Default)]
    struct FakeExecutor {
        calls: AtomicUsize,
        rows: usize,
    }

    impl QueryExecutor for FakeExecutor {
        type Error = std::io::Error;

        async fn fetch_rows(&self, request: &PageRequest) -> Result<Vec<Row>, Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = request.offset();
            Ok((0..self.rows as u64)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("id".to_owned(), json!(start + i));
                    row
                })
                .collect())
        }
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn row(pairs: Value) -> Row {
        pairs.as_object().cloned().unwrap()
    }

    #[test]
    fn page_request_offset() {
        let request = PageRequest::new("/v3/locations", params(&[("page", "3"), ("limit", "50")]));
        assert_eq!(request.offset(), 100);

        let defaults = PageRequest::new("/v3/locations", params(&[("page", "zero")]));
        assert_eq!(defaults.page, Pagination::default());
    }

    #[test]
    fn found_prefers_reported_total() {
        let rows = vec![row(json!({"id": 1, "found": 1234}))];
        assert_eq!(Found::from_rows(&rows, 100), Found::Exact(1234));
    }

    #[test]
    fn found_marks_full_pages_as_lower_bound() {
        let rows = vec![row(json!({"id": 1})), row(json!({"id": 2}))];
        assert_eq!(Found::from_rows(&rows, 2), Found::MoreThan(2));
        assert_eq!(Found::from_rows(&rows, 10), Found::Exact(2));
        assert_eq!(Found::from_rows(&[], 10), Found::Exact(0));
    }

    #[test]
    fn found_serializes_lower_bound_as_string() {
        assert_eq!(serde_json::to_value(Found::MoreThan(100)).unwrap(), json!(">100"));
        assert_eq!(serde_json::to_value(Found::Exact(7)).unwrap(), json!(7));
    }

    #[tokio::test]
    async fn identical_pages_query_the_database_once() {
        let executor = Arc::new(FakeExecutor {
            rows: 2,
            ..FakeExecutor::default()
        });
        let cache = Arc::new(QueryCache::new(CacheSettings::default()));
        let queries = CachedQueries::new(Arc::clone(&executor), cache)
            .with_website("https://api.example.org");

        let first = queries
            .fetch_page("/v3/locations", &params(&[("iso", "US"), ("limit", "2")]))
            .await
            .unwrap();
        let second = queries
            .fetch_page("/v3/locations", &params(&[("limit", "2"), ("iso", "us")]))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let body: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(body["meta"]["website"], "https://api.example.org");
        assert_eq!(body["meta"]["found"], ">2");
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn different_pages_are_cached_separately() {
        let executor = Arc::new(FakeExecutor {
            rows: 1,
            ..FakeExecutor::default()
        });
        let cache = Arc::new(QueryCache::new(CacheSettings::default()));
        let queries = CachedQueries::new(Arc::clone(&executor), cache);

        let one = queries
            .fetch_page("/v3/countries", &params(&[("page", "1")]))
            .await
            .unwrap();
        let two = queries
            .fetch_page("/v3/countries", &params(&[("page", "2")]))
            .await
            .unwrap();

        assert_ne!(one, two);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queries.cache().metrics().entry_count, 2);
    }
}
