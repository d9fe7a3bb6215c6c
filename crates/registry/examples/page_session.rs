use anyhow::Result;
use async_trait::async_trait;
use loadwatch_core::{FetchRequest, FetchResponse, Fetcher, LoaderConfig, TransportError};
use loadwatch_page::{ElementEvent, Page, Subtree};
use loadwatch_registry::{ModuleRegistry, init_loader};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const HTML: &str = r#"<!doctype html>
<html>
  <head><title>Journal</title></head>
  <body>
    <div class="loader" data-app-loader></div>
    <main id="posts"></main>
  </body>
</html>"#;

/// Answers after a short delay so the indicator has something to show.
struct SlowNetwork;

#[async_trait]
impl Fetcher for SlowNetwork {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        if request.url.ends_with("/missing.json") {
            return Ok(
                FetchResponse::new(request.url, 404, Vec::new()).with_status_text("Not Found")
            );
        }
        let body = serde_json::json!({ "url": request.url, "posts": ["hello", "world"] });
        Ok(FetchResponse::new(request.url, 200, body.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let mut config = LoaderConfig::from_env();
    if !config.has_base_url() {
        config = config.with_base_url("https://api.example.com");
    }
    let page = Arc::new(Page::with_fetcher(
        "https://journal.example.com/",
        HTML,
        Arc::new(SlowNetwork),
    ));
    let registry = ModuleRegistry::new();
    let (loader, api) = init_loader(&registry, Arc::clone(&page), config);

    // Late markup: one stylesheet and one script the page did not ship with.
    let injected = page.append_html(
        Subtree::Head,
        r#"<link rel="stylesheet" href="/theme.css"><script src="/comments.js"></script>"#,
    );
    info!(active = loader.active_count(), "Injected late resources");

    let (a, b, missing) = tokio::join!(
        api.load_json("/posts.json", None),
        api.load_json("/posts.json", None),
        api.load_json("/missing.json", None),
    );
    info!(same = Arc::ptr_eq(&a?, &b?), cached = api.cache_size(), "Posts loaded");
    if let Err(e) = missing {
        info!(error = %e, category = ?e.category(), "Expected failure");
    }

    let feed = page.fetch(FetchRequest::get("https://cdn.example.com/feed.json")).await?;
    info!(status = feed.status, "Third-party fetch settled");

    for node in injected {
        page.dispatch(node, ElementEvent::Load);
    }
    info!(busy = loader.is_busy(), "All work settled");

    registry.reset();
    Ok(())
}
