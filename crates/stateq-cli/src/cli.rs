use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use stateq_backend::cache::DiskCache;
use stateq_backend::config::QueryConfig;
use stateq_backend::decrypt;
use stateq_backend::env::ProcessEnv;
use stateq_backend::paginate::Augmenter;
use stateq_backend::tfe::WorkspaceListOptions;
use stateq_backend::{new_backend, new_remote_backend, BackendContext, QueryFlags, RevisionRecord, VersionSelector};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::rootdir::parse_root_dir;

#[derive(Parser)]
#[command(name = "stateq")]
#[command(about = "Query Terraform and OpenTofu state across backends", long_about = None)]
pub struct Cli {
    /// Hosted API hostname.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Organization name.
    #[arg(long, global = true)]
    pub org: Option<String>,

    /// Workspace name.
    #[arg(long, global = true)]
    pub workspace: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print a state document.
    Sq {
        /// Working directory, optionally suffixed with `::WORKSPACE`.
        root: Option<String>,
        /// Revision address.
        #[arg(long, default_value = "0")]
        sv: String,
        /// Print two revisions as a JSON array instead. Takes up to two
        /// addresses, or `+` to pick from the revision list.
        #[arg(long, num_args = 0..=2, value_name = "SPEC")]
        diff: Option<Vec<String>>,
        /// Passphrase for encrypted state.
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// List state revisions as JSON.
    Svq {
        root: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Re-read each revision with outputs, run and creator included.
        #[arg(long)]
        deep: bool,
        /// Print only the revision this address selects.
        #[arg(long)]
        sv: Option<String>,
    },
    /// List runs as JSON.
    Rq {
        root: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List organization workspaces as JSON.
    Wq {
        root: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Fuzzy name search.
        #[arg(long)]
        search: Option<String>,
        /// Comma-separated tags that must be present.
        #[arg(long)]
        tags: Option<String>,
    },
    /// Disk cache maintenance.
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
}

#[derive(Subcommand, Clone)]
pub enum CacheCmd {
    /// Remove entries older than the given age.
    Purge {
        /// Age in hours; defaults to the configured `cache.clean`.
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Print the cache directory.
    Dir,
}

impl Cli {
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        match &self.command {
            Command::Sq {
                root,
                sv,
                diff,
                passphrase,
            } => self.sq(&cancel, root.as_deref(), sv, diff.as_deref(), passphrase.as_deref()).await,
            Command::Svq {
                root,
                limit,
                deep,
                sv,
            } => self.svq(&cancel, root.as_deref(), *limit, *deep, sv.as_deref()).await,
            Command::Rq { root, limit } => self.rq(&cancel, root.as_deref(), *limit).await,
            Command::Wq {
                root,
                limit,
                search,
                tags,
            } => self.wq(&cancel, root.as_deref(), *limit, search.clone(), tags.clone()).await,
            Command::Cache { cmd } => self.cache(cmd),
        }
    }

    fn flags(&self, command: &str) -> QueryFlags {
        let mut flags = QueryFlags::for_command(command);
        flags.host = self.host.clone();
        flags.org = self.org.clone();
        flags.workspace = self.workspace.clone();
        flags
    }

    fn context(&self, cancel: &CancellationToken, root: Option<&str>, flags: QueryFlags) -> Result<BackendContext> {
        let (dir, env_override) = parse_root_dir(root.unwrap_or("."))?;
        let config = QueryConfig::locate(&ProcessEnv)?.with_namespace(flags.command.clone());
        if let Some(source) = config.source() {
            debug!("config loaded from {}", source.display());
        }
        let mut ctx = BackendContext::new(dir)
            .with_config(config)
            .with_flags(flags)
            .with_cancel(cancel.clone());
        if let Some(env) = env_override {
            ctx = ctx.with_env_override(env);
        }
        Ok(ctx)
    }

    async fn sq(
        &self,
        cancel: &CancellationToken,
        root: Option<&str>,
        sv: &str,
        diff: Option<&[String]>,
        passphrase: Option<&str>,
    ) -> Result<()> {
        let mut flags = self.flags("sq");
        flags.revision = sv.to_string();
        flags.diff = diff.is_some();
        flags.diff_args = diff.map(<[String]>::to_vec).unwrap_or_default();
        flags.passphrase = passphrase.map(str::to_string);

        let ctx = self.context(cancel, root, flags)?;
        let passphrase = decrypt::resolve_passphrase(passphrase, &ProcessEnv);
        let mut backend = new_backend(ctx).await?;
        debug!("backend: {}", backend);

        if diff.is_some() {
            let kind = backend.type_name();
            let Some(differ) = backend.as_self_differ() else {
                bail!("the {kind} backend cannot diff its own revisions");
            };
            let Some(docs) = differ.diff_states(&PromptSelector).await? else {
                debug!("nothing selected to diff");
                return Ok(());
            };
            let docs = docs
                .iter()
                .map(|doc| plaintext(doc, passphrase.as_deref()).map(|doc| as_json(&doc)))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
            return Ok(());
        }

        let doc = plaintext(&backend.state().await?, passphrase.as_deref())?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&doc)?;
        if !doc.ends_with(b"\n") {
            stdout.write_all(b"\n")?;
        }
        Ok(())
    }

    async fn svq(
        &self,
        cancel: &CancellationToken,
        root: Option<&str>,
        limit: Option<usize>,
        deep: bool,
        sv: Option<&str>,
    ) -> Result<()> {
        let mut flags = self.flags("svq");
        flags.limit = limit;
        flags.deep = deep;
        let mut backend = new_backend(self.context(cancel, root, flags)?).await?;

        if let Some(spec) = sv {
            let record = backend.state_version(spec).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            return Ok(());
        }

        let records = backend.state_versions(None).await?;
        println!("{}", serde_json::to_string_pretty(&records)?);
        Ok(())
    }

    async fn rq(&self, cancel: &CancellationToken, root: Option<&str>, limit: Option<usize>) -> Result<()> {
        let mut flags = self.flags("rq");
        flags.limit = limit;
        let mut backend = new_backend(self.context(cancel, root, flags)?).await?;
        let runs = backend.runs().await?;
        println!("{}", serde_json::to_string_pretty(&runs)?);
        Ok(())
    }

    async fn wq(
        &self,
        cancel: &CancellationToken,
        root: Option<&str>,
        limit: Option<usize>,
        search: Option<String>,
        tags: Option<String>,
    ) -> Result<()> {
        let mut flags = self.flags("wq");
        flags.limit = limit;
        let backend = new_remote_backend(self.context(cancel, root, flags)?)?;

        let filter = move |opts: &mut WorkspaceListOptions| {
            opts.search = search.clone();
            opts.tags = tags.clone();
            Ok(())
        };
        let augmenter: &Augmenter<WorkspaceListOptions> = &filter;
        let workspaces = backend.workspaces(Some(augmenter)).await?;
        println!("{}", serde_json::to_string_pretty(&workspaces)?);
        Ok(())
    }

    fn cache(&self, cmd: &CacheCmd) -> Result<()> {
        let env = ProcessEnv;
        let cache = DiskCache::from_env(&env);
        match cmd {
            CacheCmd::Dir => {
                match cache.base_dir() {
                    Some(dir) if cache.is_enabled() => println!("{}", dir.display()),
                    Some(dir) => println!("{} (disabled)", dir.display()),
                    None => println!("(no cache directory)"),
                }
                Ok(())
            }
            CacheCmd::Purge { hours } => {
                let hours = purge_hours(*hours, &QueryConfig::locate(&env)?);
                let stats = cache.purge(hours)?;
                println!(
                    "scanned {} entries, removed {}, failed {}",
                    stats.scanned, stats.removed, stats.failed
                );
                Ok(())
            }
        }
    }
}

/// Purge age: the flag, else the bare `cache.clean` key, else disabled.
fn purge_hours(flag: Option<i64>, config: &QueryConfig) -> i64 {
    flag.or_else(|| config.get_int("cache.clean")).unwrap_or(0)
}

/// Decrypt `doc` when it is an encrypted envelope.
fn plaintext(doc: &[u8], passphrase: Option<&str>) -> Result<Vec<u8>> {
    if !decrypt::is_encrypted(doc) {
        return Ok(doc.to_vec());
    }
    let Some(passphrase) = passphrase else {
        bail!("state is encrypted; pass --passphrase or set STATEQ_PASSPHRASE");
    };
    decrypt::decrypt_state(doc, passphrase).context("failed to decrypt state")
}

fn as_json(doc: &[u8]) -> Value {
    serde_json::from_slice(doc).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(doc).into_owned()))
}

/// Revision picker reading indices from stdin.
struct PromptSelector;

impl VersionSelector for PromptSelector {
    fn select(&self, records: &[RevisionRecord]) -> Vec<RevisionRecord> {
        let mut stderr = std::io::stderr().lock();
        for (i, record) in records.iter().enumerate() {
            let _ = writeln!(
                stderr,
                "{:>3}  {}  serial={:<6} {}",
                i + 1,
                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                record.serial,
                record.id
            );
        }
        let _ = write!(stderr, "pick two revisions (e.g. `1 3`), empty to cancel: ");
        let _ = stderr.flush();

        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_err() {
            return Vec::new();
        }
        parse_picks(&line, records.len())
            .into_iter()
            .filter_map(|i| records.get(i).cloned())
            .collect()
    }
}

/// One-based indices from `line`, deduplicated and ordered newest first.
fn parse_picks(line: &str, len: usize) -> Vec<usize> {
    let mut picks: Vec<usize> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|s| s.parse::<usize>().ok())
        .filter(|i| (1..=len).contains(i))
        .map(|i| i - 1)
        .collect();
    picks.sort_unstable();
    picks.dedup();
    picks
}
