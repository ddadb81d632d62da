//! Remote backend against the in-memory hosted API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use stateq_backend::backend::StateVersionAugmenter;
use stateq_backend::cache::DiskCache;
use stateq_backend::config::QueryConfig;
use stateq_backend::env::MapEnv;
use stateq_backend::paginate::Augmenter;
use stateq_backend::remote::{RemoteBackend, RemoteConfig, WorkspacesBlock};
use stateq_backend::revision::WorkspaceRecord;
use stateq_backend::tfe::{MockTfeApi, StateVersionListOptions, WorkspaceListOptions};
use stateq_backend::{Backend, BackendContext, BackendError, Locator, QueryFlags, RevisionRecord};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn history(n: i64) -> MockTfeApi {
    (1..=n).rev().fold(MockTfeApi::new(), |api, serial| {
        api.with_state_version(
            RevisionRecord::new(
                format!("sv-{serial:04}"),
                Utc.timestamp_opt(1_700_000_000 + serial * 60, 0).unwrap(),
                serial,
                Locator::None,
            ),
            format!(r#"{{"version":4,"serial":{serial}}}"#),
        )
    })
}

fn pointer() -> RemoteConfig {
    RemoteConfig {
        hostname: Some("app.terraform.io".to_string()),
        organization: Some("acme".to_string()),
        token: Some(json!("pointer-token")),
        workspaces: Some(WorkspacesBlock {
            name: Some("network".to_string()),
            prefix: None,
        }),
    }
}

fn context(flags: QueryFlags) -> BackendContext {
    BackendContext::new(".")
        .with_env(Arc::new(MapEnv::new()))
        .with_cache(DiskCache::disabled())
        .with_flags(flags)
}

#[tokio::test]
async fn current_only_requests_one_record() {
    let api = Arc::new(history(120));
    let mut backend = RemoteBackend::with_api(context(QueryFlags::for_command("sq")), pointer(), api.clone());

    let doc = backend.state().await.unwrap();
    assert_eq!(doc, br#"{"version":4,"serial":120}"#);
    let stats = api.stats();
    assert_eq!(stats.page_sizes, [1]);
    assert_eq!(stats.downloads, 1);
}

#[tokio::test]
async fn full_listing_walks_every_page() {
    let api = Arc::new(history(250));
    let mut backend = RemoteBackend::with_api(context(QueryFlags::for_command("svq")), pointer(), api.clone());

    let records = backend.state_versions(None).await.unwrap();
    assert_eq!(records.len(), 250);
    assert_eq!(records[0].serial, 250);
    assert!(records.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    assert_eq!(api.stats().page_sizes, [100, 100, 100]);
}

#[tokio::test]
async fn augmenter_runs_before_each_page() {
    let api = Arc::new(history(25));
    let mut backend = RemoteBackend::with_api(context(QueryFlags::for_command("svq")), pointer(), api.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let augment: &StateVersionAugmenter = &move |opts: &mut StateVersionListOptions| {
        counter.fetch_add(1, Ordering::SeqCst);
        opts.list.page_size = 10;
        Ok(())
    };
    let records = backend.state_versions(Some(augment)).await.unwrap();
    assert_eq!(records.len(), 25);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(api.stats().page_sizes, [10, 10, 10]);
}

#[tokio::test]
async fn limit_caps_records_and_page_size() {
    let api = Arc::new(history(60));
    let mut flags = QueryFlags::for_command("svq");
    flags.limit = Some(15);
    let mut backend = RemoteBackend::with_api(context(flags), pointer(), api.clone());

    assert_eq!(backend.state_versions(None).await.unwrap().len(), 15);
    assert_eq!(api.stats().page_sizes, [15]);
}

#[tokio::test]
async fn cancelled_download_returns_promptly() {
    let api = Arc::new(history(3).hanging_downloads());
    let cancel = CancellationToken::new();
    let ctx = context(QueryFlags::for_command("svq")).with_cancel(cancel.clone());
    let mut backend = RemoteBackend::with_api(ctx, pointer(), api.clone());

    backend.state_versions(None).await.unwrap();
    cancel.cancel();
    let result = backend.states(&["CSV~0".to_string()]).await;
    assert!(matches!(result, Err(BackendError::Cancelled(_))));
}

#[tokio::test]
async fn cancellation_interrupts_a_pending_download() {
    let api = Arc::new(history(3).hanging_downloads());
    let cancel = CancellationToken::new();
    let ctx = context(QueryFlags::for_command("sq")).with_cancel(cancel.clone());
    let mut backend = RemoteBackend::with_api(ctx, pointer(), api.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let result = backend.state().await;
    trigger.await.unwrap();
    assert!(matches!(result, Err(BackendError::Cancelled(_))));
    assert_eq!(api.stats().downloads, 1);
}

#[tokio::test]
async fn unauthorized_names_per_host_token_variable() {
    let api = Arc::new(MockTfeApi::new().unauthorized());
    let mut backend = RemoteBackend::with_api(context(QueryFlags::for_command("svq")), pointer(), api);

    let err = backend.state_versions(None).await.unwrap_err();
    assert!(err.to_string().contains("TF_TOKEN_app_terraform_io"));
}

#[tokio::test]
async fn documents_come_from_cache_on_second_read() {
    let cache_dir = TempDir::new().unwrap();
    let api = Arc::new(history(2));
    let ctx = context(QueryFlags::for_command("sq")).with_cache(DiskCache::at(cache_dir.path()));

    let mut first = RemoteBackend::with_api(ctx.clone(), pointer(), api.clone());
    let mut second = RemoteBackend::with_api(ctx, pointer(), api.clone());
    assert_eq!(first.state().await.unwrap(), second.state().await.unwrap());
    assert_eq!(api.stats().downloads, 1);
}

#[tokio::test]
async fn cache_namespace_honors_environment_overrides() {
    let cache_dir = TempDir::new().unwrap();
    let api = Arc::new(history(1));
    let env = MapEnv::new()
        .with_var("TFE_HOSTNAME", "mirror")
        .with_var("TFE_ORGANIZATION", "shared");
    let ctx = BackendContext::new(".")
        .with_env(Arc::new(env))
        .with_cache(DiskCache::at(cache_dir.path()))
        .with_flags(QueryFlags::for_command("sq"));

    let mut backend = RemoteBackend::with_api(ctx, pointer(), api);
    backend.state().await.unwrap();
    assert!(cache_dir.path().join("mirror").join("shared").is_dir());
}

#[tokio::test]
async fn workspaces_listing_with_search() {
    let api = ["net-prod", "net-dev", "app-prod"].iter().fold(MockTfeApi::new(), |api, name| {
        api.with_workspace(WorkspaceRecord {
            id: format!("ws-{name}"),
            name: name.to_string(),
            current_state_version: None,
            detail: None,
        })
    });
    let api = Arc::new(api);
    let ctx = context(QueryFlags::for_command("wq"))
        .with_config(QueryConfig::from_value(json!({"org": "acme"})));
    let backend = RemoteBackend::with_api(ctx, RemoteConfig::default(), api.clone());

    let search: &Augmenter<WorkspaceListOptions> = &|opts: &mut WorkspaceListOptions| {
        opts.search = Some("net".to_string());
        Ok(())
    };
    let found = backend.workspaces(Some(search)).await.unwrap();
    let names: Vec<_> = found.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(names, ["net-prod", "net-dev"]);
    assert_eq!(api.stats().list_workspaces, 1);
}
