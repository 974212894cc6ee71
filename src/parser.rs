//! HTML link extraction and child-task production.
//!
//! Parse workers take fetched HTML bodies, pull `<a href>` targets, resolve
//! them against the page URL, and feed never-seen canonical URLs back to the
//! scheduler one depth level down. Cross-host discoveries also emit edge
//! events for the host graph.

use crate::canonical::{canonicalize, host_key};
use crate::dedup::Deduper;
use crate::engine::StopSignal;
use crate::errors;
use crate::storage::{RunId, SinkEvent};
use crate::task::{ParseJob, Task};
use crate::telemetry::{EdgeEvent, FetchEvent};
use scraper::{Html, Selector};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use url::Url;

/// Extract raw href values from `<a>` tags, in document order. Skips hrefs
/// that can never become crawlable URLs.
pub fn extract_links(html_body: &str) -> Vec<String> {
    let document = Html::parse_document(html_body);
    let selector = Selector::parse("a[href]").expect("static selector");

    let mut links = Vec::new();
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            let href = href.trim();
            if href.is_empty()
                || href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
                || href.starts_with("file:")
            {
                continue;
            }
            links.push(href.to_string());
        }
    }
    links
}

pub(crate) struct Parser {
    pub(crate) run_id: RunId,
    pub(crate) max_depth: u32,
    pub(crate) max_links_per_page: usize,
    pub(crate) deduper: Arc<Deduper>,
    pub(crate) enqueue_tx: mpsc::Sender<Task>,
    pub(crate) sink_tx: mpsc::Sender<SinkEvent>,
    pub(crate) fetch_events: mpsc::Sender<FetchEvent>,
    pub(crate) edge_events: mpsc::Sender<EdgeEvent>,
    pub(crate) stop: StopSignal,
}

impl Parser {
    pub(crate) async fn run(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<ParseJob>>>) {
        loop {
            let job = tokio::select! {
                _ = self.stop.cancelled() => return,
                job = async { rx.lock().await.recv().await } => match job {
                    Some(j) => j,
                    None => return,
                },
            };
            self.handle(job).await;
        }
    }

    async fn handle(&self, job: ParseJob) {
        // The fetcher never queues a job at the depth cap, but the limit is
        // cheap to re-check here where children are actually made.
        if self.max_depth > 0 && job.depth >= self.max_depth {
            return;
        }

        let body = match String::from_utf8(job.body) {
            Ok(text) => text,
            Err(err) => {
                // The page itself was recorded as fetched; surface the
                // decode failure as a supplemental parse error.
                let _ = self.fetch_events.try_send(FetchEvent {
                    host: job.host.clone(),
                    latency_ms: 0,
                    bytes: 0,
                    reused_conn: false,
                    err_class: Some(errors::PARSE),
                });
                let _ = self.sink_tx.try_send(SinkEvent::Error {
                    run_id: self.run_id,
                    host: job.host.clone(),
                    url: job.base.to_string(),
                    class: errors::PARSE,
                    message: err.to_string(),
                });
                return;
            }
        };

        let links = extract_links(&body);
        drop(body);

        let mut links_found = 0usize;
        for link in links {
            if self.max_links_per_page > 0 && links_found >= self.max_links_per_page {
                break;
            }
            if let Some(child) = self.make_child(&job.base, &job.host, job.depth, &link) {
                links_found += 1;
                let dst = child.host.clone();
                if dst != job.host {
                    let _ = self.edge_events.try_send(EdgeEvent {
                        src: job.host.clone(),
                        dst: dst.clone(),
                    });
                    let _ = self.sink_tx.try_send(SinkEvent::Edge {
                        run_id: self.run_id,
                        src: job.host.clone(),
                        dst,
                        count: 1,
                    });
                }
                tokio::select! {
                    _ = self.stop.cancelled() => return,
                    result = self.enqueue_tx.send(child) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Resolve one href into a child task, or `None` when it is malformed,
    /// unsupported, or already seen.
    fn make_child(&self, base: &Url, src_host: &str, depth: u32, link: &str) -> Option<Task> {
        // Protocol-relative links inherit the page scheme.
        let absolute = if let Some(rest) = link.strip_prefix("//") {
            format!("{}://{}", base.scheme(), rest)
        } else {
            match base.join(link) {
                Ok(resolved) => resolved.to_string(),
                Err(_) => return None,
            }
        };
        let (canonical, parsed) = canonicalize(&absolute).ok()?;
        if self.deduper.seen(&canonical) {
            return None;
        }
        let host = host_key(&parsed);
        Some(Task::new(
            parsed,
            canonical,
            host,
            depth + 1,
            Some(src_host.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_absolute_and_relative_links() {
        let html = r#"<html><body>
            <a href="https://example.com/page1">One</a>
            <a href="/about">About</a>
            <a href="../up">Up</a>
        </body></html>"#;
        assert_eq!(
            extract_links(html),
            vec!["https://example.com/page1", "/about", "../up"]
        );
    }

    #[test]
    fn skips_non_crawlable_schemes() {
        let html = r##"<html><body>
            <a href="javascript:void(0)">js</a>
            <a href="mailto:a@b.c">mail</a>
            <a href="tel:+1555">tel</a>
            <a href="data:text/plain,x">data</a>
            <a href="#frag">frag</a>
            <a href="">empty</a>
            <a href="/real">real</a>
        </body></html>"##;
        assert_eq!(extract_links(html), vec!["/real"]);
    }

    #[test]
    fn tolerates_malformed_html() {
        let html = r#"<html><body><a href="/ok">ok<div><p>unclosed"#;
        assert_eq!(extract_links(html), vec!["/ok"]);
    }

    #[test]
    fn no_links_in_plain_document() {
        assert!(extract_links("<html><body><p>text</p></body></html>").is_empty());
        assert!(extract_links("").is_empty());
    }

    mod children {
        use super::*;
        use std::sync::Arc;

        fn parser(max_depth: u32, max_links: usize) -> (Parser, mpsc::Receiver<Task>) {
            let (enqueue_tx, enqueue_rx) = mpsc::channel(64);
            let (sink_tx, _sink_rx) = mpsc::channel(64);
            let (fetch_tx, _fetch_rx) = mpsc::channel(64);
            let (edge_tx, _edge_rx) = mpsc::channel(64);
            let parser = Parser {
                run_id: uuid::Uuid::new_v4(),
                max_depth,
                max_links_per_page: max_links,
                deduper: Arc::new(Deduper::default()),
                enqueue_tx,
                sink_tx,
                fetch_events: fetch_tx,
                edge_events: edge_tx,
                stop: StopSignal::new(),
            };
            (parser, enqueue_rx)
        }

        #[tokio::test]
        async fn children_are_deduped_and_deeper() {
            let (parser, _rx) = parser(0, 0);
            let base = Url::parse("http://a.test/page").unwrap();

            let child = parser.make_child(&base, "a.test", 1, "/next").unwrap();
            assert_eq!(child.depth, 2);
            assert_eq!(child.host, "a.test");
            assert_eq!(child.canonical, "http://a.test/next");
            assert_eq!(child.source_host.as_deref(), Some("a.test"));

            // Second resolution of the same target is suppressed.
            assert!(parser.make_child(&base, "a.test", 1, "/next").is_none());
        }

        #[tokio::test]
        async fn protocol_relative_inherits_scheme() {
            let (parser, _rx) = parser(0, 0);
            let base = Url::parse("https://a.test/page").unwrap();
            let child = parser.make_child(&base, "a.test", 0, "//b.test/x").unwrap();
            assert_eq!(child.url.scheme(), "https");
            assert_eq!(child.host, "b.test");
        }

        #[tokio::test]
        async fn depth_cap_blocks_children() {
            let (parser, mut rx) = parser(2, 0);
            let job = ParseJob {
                base: Url::parse("http://a.test/").unwrap(),
                host: "a.test".to_string(),
                depth: 2,
                body: br#"<a href="/child">c</a>"#.to_vec(),
            };
            parser.handle(job).await;
            assert!(rx.try_recv().is_err());
        }

        #[tokio::test]
        async fn link_cap_bounds_extraction() {
            let (parser, mut rx) = parser(0, 2);
            let body = (0..10)
                .map(|i| format!(r#"<a href="/p{i}">x</a>"#))
                .collect::<String>();
            let job = ParseJob {
                base: Url::parse("http://a.test/").unwrap(),
                host: "a.test".to_string(),
                depth: 0,
                body: body.into_bytes(),
            };
            parser.handle(job).await;

            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            assert_eq!(count, 2);
        }

        #[tokio::test]
        async fn invalid_utf8_records_parse_error() {
            let (enqueue_tx, _enqueue_rx) = mpsc::channel(64);
            let (sink_tx, mut sink_rx) = mpsc::channel(64);
            let (fetch_tx, _fetch_rx) = mpsc::channel(64);
            let (edge_tx, _edge_rx) = mpsc::channel(64);
            let parser = Parser {
                run_id: uuid::Uuid::new_v4(),
                max_depth: 0,
                max_links_per_page: 0,
                deduper: Arc::new(Deduper::default()),
                enqueue_tx,
                sink_tx,
                fetch_events: fetch_tx,
                edge_events: edge_tx,
                stop: StopSignal::new(),
            };
            let job = ParseJob {
                base: Url::parse("http://a.test/").unwrap(),
                host: "a.test".to_string(),
                depth: 0,
                body: vec![0xff, 0xfe, 0xfd],
            };
            parser.handle(job).await;

            match sink_rx.try_recv().unwrap() {
                SinkEvent::Error { class, .. } => assert_eq!(class, errors::PARSE),
                other => panic!("unexpected sink event: {other:?}"),
            }
        }
    }
}
