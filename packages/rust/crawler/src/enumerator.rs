//! Ordered unit enumeration for one entity.
//!
//! Explicit listings are turned into oldest-first [`UnitRef`]s. Numeric
//! probing walks `k+1, k+2, ...` through the shared pool and stops after
//! `K` consecutive misses; the probe responses are the fetched units.

use tracing::{debug, info, instrument};
use url::Url;

use storysync_shared::{EntityId, ListingOrder, Result, UnitRef};

use crate::fetcher::{ConcurrentFetcher, FetchBatch};
use crate::profile::UnitLink;

/// Turn page-order unit anchors into oldest-first references with 1-based
/// ordinals. Anchors without text are named after their last path segment.
pub fn enumerate_explicit(links: &[UnitLink], order: ListingOrder) -> Vec<UnitRef> {
    let mut ordered: Vec<&UnitLink> = links.iter().collect();
    if order == ListingOrder::NewestFirst {
        ordered.reverse();
    }

    ordered
        .into_iter()
        .zip(1u32..)
        .map(|(link, ordinal)| UnitRef {
            ordinal,
            name: unit_name(link),
            url: link.url.clone(),
        })
        .collect()
}

fn unit_name(link: &UnitLink) -> String {
    if !link.name.trim().is_empty() {
        return link.name.trim().to_string();
    }
    link.url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or(link.url.as_str())
        .to_string()
}

/// Outcome of numeric probing.
#[derive(Debug, Default)]
pub struct ProbeOutcome {
    /// Every probe, sorted; `units` are the hits.
    pub batch: FetchBatch,
    /// Number of probes issued.
    pub probes: u32,
    /// Highest ordinal that yielded assets, or the resume point if none did.
    pub ceiling: u32,
}

/// Probe synthesized unit URLs starting after `resume_from`.
///
/// Probes go out in windows of at most `min(W, K - misses)`, so the run of
/// consecutive misses can never exceed `miss_limit`. 404s, empty pages and
/// exhausted transport failures all count as misses.
#[instrument(skip_all, fields(entity_id = %id, resume_from))]
pub async fn probe_numeric(
    pool: &ConcurrentFetcher,
    entry_url: &Url,
    id: &EntityId,
    resume_from: u32,
    miss_limit: u32,
) -> Result<ProbeOutcome> {
    let miss_limit = miss_limit.max(1);
    let mut outcome = ProbeOutcome {
        ceiling: resume_from,
        ..Default::default()
    };
    let mut next = resume_from.saturating_add(1);
    let mut misses = 0u32;

    while misses < miss_limit && next < u32::MAX {
        let width = (pool.workers() as u32).min(miss_limit - misses).max(1);
        let window: Vec<u32> = (next..next.saturating_add(width)).collect();
        next = next.saturating_add(width);

        let refs = window
            .iter()
            .map(|&n| {
                Ok(UnitRef {
                    ordinal: n,
                    name: pool.profile().synthesized_unit_name(n),
                    url: pool.profile().synthesized_unit_url(entry_url, id.as_str(), n)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let batch = pool.fetch_units(refs).await;
        outcome.probes += width;

        for n in &window {
            if batch.units.iter().any(|u| u.ordinal == *n) {
                misses = 0;
                outcome.ceiling = *n;
            } else {
                misses += 1;
            }
        }
        debug!(
            window_start = window[0],
            width,
            hits = batch.units.len(),
            misses,
            "probe window done"
        );
        outcome.batch.absorb(batch);
    }

    info!(
        probes = outcome.probes,
        found = outcome.batch.units.len(),
        ceiling = outcome.ceiling,
        "numeric probing finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use storysync_shared::SourceProfile;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use crate::http::PageFetcher;
    use crate::profile::CompiledProfile;
    use crate::retry::RetryPolicy;

    fn link(name: &str, path: &str) -> UnitLink {
        UnitLink {
            name: name.into(),
            url: Url::parse(&format!("https://example.com{path}")).unwrap(),
        }
    }

    #[test]
    fn newest_first_listing_is_reversed() {
        let links: Vec<UnitLink> = (1..=5)
            .rev()
            .map(|n| link(&format!("u{n}"), &format!("/m/chapter-{n}")))
            .collect();
        let refs = enumerate_explicit(&links, ListingOrder::NewestFirst);

        let pairs: Vec<(u32, &str)> = refs.iter().map(|r| (r.ordinal, r.name.as_str())).collect();
        assert_eq!(
            pairs,
            vec![(1, "u1"), (2, "u2"), (3, "u3"), (4, "u4"), (5, "u5")]
        );
    }

    #[test]
    fn oldest_first_listing_is_kept() {
        let links = vec![link("a", "/m/chapter-1"), link("b", "/m/chapter-2")];
        let refs = enumerate_explicit(&links, ListingOrder::OldestFirst);
        assert_eq!(refs[0].name, "a");
        assert_eq!(refs[1].ordinal, 2);
    }

    #[test]
    fn empty_anchor_text_uses_path_segment() {
        let refs = enumerate_explicit(&[link("  ", "/m/chapter-9/")], ListingOrder::NewestFirst);
        assert_eq!(refs[0].name, "chapter-9");
    }

    /// Serves assets for chapters `1..=last` except `missing`; 404 otherwise.
    struct Chapters {
        last: u32,
        missing: Vec<u32>,
    }

    impl Respond for Chapters {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let n: u32 = request
                .url
                .path()
                .rsplit('-')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if (1..=self.last).contains(&n) && !self.missing.contains(&n) {
                ResponseTemplate::new(200).set_body_string(format!(
                    r#"<div class="reading-detail"><img src="https://img.example.com/{n}.jpg"></div>"#
                ))
            } else {
                ResponseTemplate::new(404)
            }
        }
    }

    fn pool(workers: usize) -> ConcurrentFetcher {
        let fetcher = PageFetcher::with_options(
            "t",
            Duration::from_secs(5),
            RetryPolicy::new(2, Duration::from_millis(1), 2.0, Duration::from_millis(5)),
        )
        .unwrap();
        let profile = CompiledProfile::compile(&SourceProfile::default()).unwrap();
        ConcurrentFetcher::new(fetcher, Arc::new(profile), workers, Duration::ZERO)
    }

    fn probed_ordinals(server_requests: &[Request]) -> Vec<u32> {
        let mut ordinals: Vec<u32> = server_requests
            .iter()
            .filter_map(|r| r.url.path().rsplit('-').next()?.parse().ok())
            .collect();
        ordinals.sort_unstable();
        ordinals
    }

    #[tokio::test]
    async fn probing_resumes_after_progress_and_stops_after_k_misses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/manga/berserk/chapter-\d+$"))
            .respond_with(Chapters {
                last: 7,
                missing: vec![],
            })
            .mount(&server)
            .await;

        let entry = Url::parse(&format!("{}/manga/berserk", server.uri())).unwrap();
        let id = EntityId::new("berserk");
        let outcome = probe_numeric(&pool(2), &entry, &id, 4, 3).await.unwrap();

        let found: Vec<u32> = outcome.batch.units.iter().map(|u| u.ordinal).collect();
        assert_eq!(found, vec![5, 6, 7]);
        assert_eq!(outcome.ceiling, 7);

        let requests = server.received_requests().await.unwrap();
        let probed = probed_ordinals(&requests);
        // Never re-requests 1..=4; stops after exactly three misses (8, 9, 10).
        assert_eq!(probed, vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(outcome.probes, 6);
    }

    #[tokio::test]
    async fn probing_is_bounded_when_nothing_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let entry = Url::parse(&format!("{}/manga/ghost", server.uri())).unwrap();
        let outcome = probe_numeric(&pool(8), &entry, &EntityId::new("ghost"), 0, 3)
            .await
            .unwrap();

        assert!(outcome.batch.units.is_empty());
        assert_eq!(outcome.ceiling, 0);
        assert_eq!(outcome.probes, 3);
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3, "404s are misses and are not retried");
    }

    #[tokio::test]
    async fn a_hole_shorter_than_k_does_not_stop_probing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/manga/x/chapter-\d+$"))
            .respond_with(Chapters {
                last: 3,
                missing: vec![2],
            })
            .mount(&server)
            .await;

        let entry = Url::parse(&format!("{}/manga/x", server.uri())).unwrap();
        let outcome = probe_numeric(&pool(1), &entry, &EntityId::new("x"), 0, 2)
            .await
            .unwrap();

        let found: Vec<u32> = outcome.batch.units.iter().map(|u| u.ordinal).collect();
        assert_eq!(found, vec![1, 3]);
        assert_eq!(outcome.batch.failed.len(), 3, "2, 4 and 5 were misses");
        assert_eq!(outcome.ceiling, 3);
    }
}
