//! Bounded-concurrency unit fetching.
//!
//! One [`ConcurrentFetcher`] is shared by every entity in a run; its
//! semaphore caps in-flight unit fetches system-wide at `W`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scraper::Html;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, warn};
use url::Url;

use storysync_shared::{Result, StorySyncError, Unit, UnitRef};

use crate::http::PageFetcher;
use crate::profile::CompiledProfile;

/// A unit that could not be turned into a [`Unit`].
#[derive(Debug)]
pub struct UnitSkip {
    pub ordinal: u32,
    pub name: String,
    pub url: Url,
    pub error: StorySyncError,
}

impl UnitSkip {
    /// The source definitively answered "no such page".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.error,
            StorySyncError::HttpStatus {
                status: 404 | 410,
                ..
            }
        )
    }
}

/// Results of fetching a set of unit references.
#[derive(Debug, Default)]
pub struct FetchBatch {
    /// Successfully fetched units, ascending by ordinal.
    pub units: Vec<Unit>,
    /// Transport or status failures after retries.
    pub failed: Vec<UnitSkip>,
    /// Pages that loaded but carried zero assets.
    pub empty: Vec<UnitSkip>,
}

impl FetchBatch {
    pub fn attempted(&self) -> usize {
        self.units.len() + self.failed.len() + self.empty.len()
    }

    /// Highest ordinal attempted in this batch, or `None` if nothing was.
    pub fn max_attempted(&self) -> Option<u32> {
        self.units
            .iter()
            .map(|u| u.ordinal)
            .chain(self.failed.iter().map(|s| s.ordinal))
            .chain(self.empty.iter().map(|s| s.ordinal))
            .max()
    }

    fn sort(&mut self) {
        self.units.sort_by_key(|u| u.ordinal);
        self.failed.sort_by_key(|s| s.ordinal);
        self.empty.sort_by_key(|s| s.ordinal);
    }

    /// Fold another batch in, keeping everything sorted.
    pub fn absorb(&mut self, other: FetchBatch) {
        self.units.extend(other.units);
        self.failed.extend(other.failed);
        self.empty.extend(other.empty);
        self.sort();
    }
}

/// Fetches unit pages through a shared worker pool.
#[derive(Clone)]
pub struct ConcurrentFetcher {
    fetcher: PageFetcher,
    profile: Arc<CompiledProfile>,
    permits: Arc<Semaphore>,
    workers: usize,
    rate_limit: Duration,
}

impl ConcurrentFetcher {
    pub fn new(
        fetcher: PageFetcher,
        profile: Arc<CompiledProfile>,
        workers: usize,
        rate_limit: Duration,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            fetcher,
            profile,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            rate_limit,
        }
    }

    /// Pool size `W`.
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn profile(&self) -> &CompiledProfile {
        &self.profile
    }

    /// Fetch every reference. Completion order is arbitrary; the returned
    /// batch is sorted by ordinal.
    pub async fn fetch_units(&self, refs: Vec<UnitRef>) -> FetchBatch {
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();

        for unit_ref in refs {
            let this = self.clone();
            let task_ref = unit_ref.clone();
            let handle = tasks.spawn(async move { this.fetch_one(&task_ref).await });
            pending.insert(handle.id(), unit_ref);
        }

        collect_batch(tasks, pending).await
    }

    async fn fetch_one(&self, unit_ref: &UnitRef) -> Result<Vec<String>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StorySyncError::transport(unit_ref.url.as_str(), "worker pool closed"))?;

        if !self.rate_limit.is_zero() {
            tokio::time::sleep(self.rate_limit).await;
        }

        // Retries cover the fetch only; an empty page is never retried.
        let body = self.fetcher.get(&unit_ref.url).await?;
        let assets = {
            let doc = Html::parse_document(&body);
            self.profile.assets(&doc, &unit_ref.url)
        };

        if assets.is_empty() {
            debug!(ordinal = unit_ref.ordinal, url = %unit_ref.url, "unit page has no assets");
            return Err(StorySyncError::EmptyContent {
                url: unit_ref.url.to_string(),
            });
        }

        debug!(ordinal = unit_ref.ordinal, assets = assets.len(), "unit fetched");
        Ok(assets)
    }
}

/// Drain unit tasks into a sorted batch. A task that panicked is recorded as
/// a failed unit, never dropped.
async fn collect_batch(
    mut tasks: JoinSet<Result<Vec<String>>>,
    mut pending: HashMap<task::Id, UnitRef>,
) -> FetchBatch {
    let mut batch = FetchBatch::default();
    while let Some(joined) = tasks.join_next_with_id().await {
        let (task_id, outcome) = match joined {
            Ok((id, outcome)) => (id, Ok(outcome)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(unit_ref) = pending.remove(&task_id) else {
            continue;
        };
        let outcome = outcome.unwrap_or_else(|e| {
            warn!(ordinal = unit_ref.ordinal, error = %e, "unit fetch task panicked");
            Err(StorySyncError::transport(
                unit_ref.url.as_str(),
                format!("fetch task failed: {e}"),
            ))
        });

        match outcome {
            Ok(asset_urls) => batch.units.push(Unit {
                ordinal: unit_ref.ordinal,
                name: unit_ref.name,
                asset_urls,
            }),
            Err(error) => {
                let skip = UnitSkip {
                    ordinal: unit_ref.ordinal,
                    name: unit_ref.name,
                    url: unit_ref.url,
                    error,
                };
                if matches!(skip.error, StorySyncError::EmptyContent { .. }) {
                    batch.empty.push(skip);
                } else {
                    batch.failed.push(skip);
                }
            }
        }
    }

    batch.sort();
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use storysync_shared::SourceProfile;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::retry::RetryPolicy;

    fn unit_page(n: u32) -> String {
        format!(
            r#"<html><body><div class="reading-detail">
                 <img data-src="https://img.example.com/{n}/1.jpg">
                 <img data-src="https://img.example.com/{n}/2.jpg">
               </div></body></html>"#
        )
    }

    fn pool(workers: usize, attempts: u32) -> ConcurrentFetcher {
        let fetcher = PageFetcher::with_options(
            "t",
            Duration::from_secs(5),
            RetryPolicy::new(attempts, Duration::from_millis(1), 2.0, Duration::from_millis(5)),
        )
        .unwrap();
        let profile = CompiledProfile::compile(&SourceProfile::default()).unwrap();
        ConcurrentFetcher::new(fetcher, Arc::new(profile), workers, Duration::ZERO)
    }

    fn unit_ref(server: &MockServer, n: u32) -> UnitRef {
        UnitRef {
            ordinal: n,
            name: format!("Chapter {n}"),
            url: Url::parse(&format!("{}/m/chapter-{n}", server.uri())).unwrap(),
        }
    }

    #[test]
    fn unit_fixture_assets() {
        let body = std::fs::read_to_string("../../../fixtures/html/unit.html").unwrap();
        let profile = CompiledProfile::compile(&SourceProfile::default()).unwrap();
        let url = Url::parse("https://example.com/manga/dao-hai-tac/chapter-3").unwrap();
        let assets = profile.assets(&Html::parse_document(&body), &url);
        assert_eq!(
            assets,
            vec![
                "https://img.example.com/dao-hai-tac/3/001.jpg",
                "https://img.example.com/dao-hai-tac/3/002.jpg",
                "https://img.example.com/dao-hai-tac/3/003.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn results_are_sorted_despite_completion_order() {
        let server = MockServer::start().await;
        for n in 1..=5u32 {
            // Earlier ordinals answer slower.
            let delay = Duration::from_millis(u64::from(6 - n) * 30);
            Mock::given(method("GET"))
                .and(path(format!("/m/chapter-{n}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(unit_page(n))
                        .set_delay(delay),
                )
                .mount(&server)
                .await;
        }

        let refs = (1..=5).map(|n| unit_ref(&server, n)).collect();
        let batch = pool(5, 1).fetch_units(refs).await;

        let ordinals: Vec<u32> = batch.units.iter().map(|u| u.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5]);
        assert_eq!(batch.units[0].asset_urls.len(), 2);
    }

    #[tokio::test]
    async fn failed_and_empty_units_are_separated() {
        let server = MockServer::start().await;
        Mock::given(path("/m/chapter-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(unit_page(1)))
            .mount(&server)
            .await;
        Mock::given(path("/m/chapter-2"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        // Empty pages are fetched exactly once.
        Mock::given(path("/m/chapter-3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body></body></html>"))
            .expect(1)
            .mount(&server)
            .await;

        let refs = (1..=3).map(|n| unit_ref(&server, n)).collect();
        let batch = pool(2, 3).fetch_units(refs).await;

        assert_eq!(batch.units.len(), 1);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].ordinal, 2);
        assert!(!batch.failed[0].is_not_found());
        assert_eq!(batch.empty.len(), 1);
        assert_eq!(batch.empty[0].ordinal, 3);
        assert_eq!(batch.max_attempted(), Some(3));
    }

    #[tokio::test]
    async fn panicked_task_is_recorded_as_failed() {
        let refs: Vec<UnitRef> = (1..=2)
            .map(|n| UnitRef {
                ordinal: n,
                name: format!("Chapter {n}"),
                url: Url::parse(&format!("https://example.com/m/chapter-{n}")).unwrap(),
            })
            .collect();

        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();
        let ok = tasks.spawn(async { Ok(vec!["https://img.example.com/1.jpg".to_string()]) });
        pending.insert(ok.id(), refs[0].clone());
        let explode = true;
        let boom = tasks.spawn(async move {
            if explode {
                panic!("asset parser blew up");
            }
            Ok(Vec::new())
        });
        pending.insert(boom.id(), refs[1].clone());

        let batch = collect_batch(tasks, pending).await;
        assert_eq!(batch.units.len(), 1);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].ordinal, 2);
        assert_eq!(batch.failed[0].error.kind(), "transport");
        assert_eq!(batch.max_attempted(), Some(2));
    }

    #[tokio::test]
    async fn slug_containing_blacklist_word_keeps_assets() {
        let server = MockServer::start().await;
        Mock::given(path("/manga/silicon-valley/chapter-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body>
                     <header><img src="/static/logo.png"></header>
                     <div class="reading-detail">
                       <img data-src="/manga/silicon-valley/1/001.jpg">
                       <img data-src="/manga/silicon-valley/1/002.jpg">
                     </div></body></html>"#,
            ))
            .mount(&server)
            .await;

        let unit = UnitRef {
            ordinal: 1,
            name: "Chapter 1".into(),
            url: Url::parse(&format!("{}/manga/silicon-valley/chapter-1", server.uri())).unwrap(),
        };
        let batch = pool(1, 1).fetch_units(vec![unit]).await;

        assert!(batch.empty.is_empty());
        assert_eq!(batch.units.len(), 1);
        assert_eq!(batch.units[0].asset_urls.len(), 2);
    }

    #[tokio::test]
    async fn pool_bounds_in_flight_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(unit_page(1))
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;

        let refs = (1..=4).map(|n| unit_ref(&server, n)).collect();
        let start = std::time::Instant::now();
        let batch = pool(2, 1).fetch_units(refs).await;
        let elapsed = start.elapsed();

        assert_eq!(batch.units.len(), 4);
        // Four 100ms fetches through two workers need at least two rounds.
        assert!(elapsed >= Duration::from_millis(200), "took {elapsed:?}");
    }
}
