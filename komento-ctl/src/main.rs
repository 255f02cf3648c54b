use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use komento_api::{Backend, CommentId, EntityId, EntityRef, EntityType, User, UserId, Uuid};
use komento_client::{
    Comment, CommentFeed, CommentStore, FeedState, FileStore, KvStore, MemoryStore, StaticSession,
    SyncConfig,
};

mod rest;
use rest::{NoChangeFeed, RestBackend};

#[derive(structopt::StructOpt)]
struct Opt {
    /// Base URL of the backend, eg. https://example.supabase.co
    #[structopt(short, long, env = "KOMENTO_HOST")]
    host: String,

    #[structopt(long, env = "KOMENTO_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Access token of the user, defaults to the api key
    #[structopt(long, env = "KOMENTO_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Id of the user to act as; read-only when unset
    #[structopt(short, long, env = "KOMENTO_USER")]
    user: Option<Uuid>,

    /// Directory persisting the comment cache across runs
    #[structopt(long, env = "KOMENTO_CACHE_DIR", parse(from_os_str))]
    cache_dir: Option<PathBuf>,

    /// JSON file overriding the sync timings
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
struct Target {
    /// post or reel
    entity_type: EntityType,

    entity_id: Uuid,
}

impl Target {
    fn entity(&self) -> EntityRef {
        EntityRef {
            entity_type: self.entity_type,
            entity_id: EntityId(self.entity_id),
        }
    }
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Print the comment threads of a post or reel
    List {
        #[structopt(flatten)]
        target: Target,
    },

    /// Post a comment
    Add {
        #[structopt(flatten)]
        target: Target,

        content: String,

        /// Comment to reply to
        #[structopt(long)]
        reply_to: Option<Uuid>,
    },

    /// Delete one of your comments and its replies
    Delete {
        #[structopt(flatten)]
        target: Target,

        comment_id: Uuid,
    },

    /// Like a comment, or unlike it if already liked
    Like {
        #[structopt(flatten)]
        target: Target,

        comment_id: Uuid,
    },

    /// Print the comment threads again on every change, until interrupted
    Watch {
        #[structopt(flatten)]
        target: Target,
    },
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let data = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading config file {path:?}"))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing config file {path:?}"))
}

async fn current_user(backend: &RestBackend, id: Option<Uuid>) -> anyhow::Result<Option<User>> {
    let Some(id) = id else {
        return Ok(None);
    };
    let id = UserId(id);
    let user = backend
        .select_users(&[id])
        .await
        .context("fetching the current user")?
        .into_iter()
        .find_map(|u| u.normalize())
        .unwrap_or_else(|| {
            tracing::warn!(%id, "current user has no profile");
            User::unknown(id)
        });
    Ok(Some(user))
}

fn print_thread(comments: &[Comment], depth: usize) {
    for c in comments {
        println!(
            "{:indent$}{} @{} ({}): {}  [{} likes{}, {} replies]",
            "",
            c.id,
            c.author.username,
            c.created_at.format("%Y-%m-%d %H:%M"),
            c.content,
            c.likes_count,
            if c.is_liked { ", liked" } else { "" },
            c.replies_count,
            indent = depth * 2,
        );
        print_thread(&c.children, depth + 1);
    }
}

fn print_state(state: &FeedState) {
    if let Some(err) = &state.error {
        eprintln!("last refresh failed: {err}");
    }
    if state.items.is_empty() {
        println!("no comments on {}", state.entity);
    }
    print_thread(&state.items, 0);
}

async fn loaded(feed: &CommentFeed) -> anyhow::Result<FeedState> {
    let state = feed.loaded().await;
    match &state.error {
        Some(err) => Err(err.clone())
            .with_context(|| format!("loading comments of {}", state.entity)),
        None => Ok(state),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = <Opt as structopt::StructOpt>::from_args();

    let config = load_config(opt.config).await?;
    let backend = Arc::new(RestBackend::new(&opt.host, opt.api_key, opt.token));
    let cache: Arc<dyn KvStore> = match opt.cache_dir {
        Some(dir) => Arc::new(FileStore::open(dir).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let session = Arc::new(StaticSession::new(current_user(&backend, opt.user).await?));
    let store = CommentStore::new(backend, Arc::new(NoChangeFeed), cache, session, config);

    match opt.cmd {
        Command::List { target } => {
            let feed = store.load_comments(target.entity());
            print_state(&loaded(&feed).await?);
        }
        Command::Add {
            target,
            content,
            reply_to,
        } => {
            let comment = store
                .add_comment(target.entity(), &content, reply_to.map(CommentId))
                .await?;
            println!("{}", comment.id);
        }
        Command::Delete { target, comment_id } => {
            let feed = store.load_comments(target.entity());
            loaded(&feed).await?;
            feed.delete_comment(CommentId(comment_id)).await?;
        }
        Command::Like { target, comment_id } => {
            let feed = store.load_comments(target.entity());
            loaded(&feed).await?;
            let res = feed.toggle_like(CommentId(comment_id)).await?;
            println!("{}", if res.liked { "liked" } else { "unliked" });
        }
        Command::Watch { target } => {
            let feed = store.load_comments(target.entity());
            let mut rx = feed.watch();
            loop {
                {
                    let state = rx.borrow_and_update();
                    if !state.loading {
                        println!("--- {} ({:?})", state.entity, state.listener);
                        print_state(&state);
                    }
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}
