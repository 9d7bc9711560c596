mod cache;
mod config;
mod gate;
mod orders;
mod reconcile;
mod refresh;
mod session;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cache::{CourseId, EntitlementStorage, EntitlementStore, MemoryStorage, SqliteStorage, UserId};
use gate::EntitlementCache;
use orders::{HttpOrderSource, PurchaseRequest};
use refresh::RefreshState;
use session::{Session, SharedSession};

#[derive(Parser, Debug)]
#[command(name = "course-gate")]
#[command(about = "Check and manage purchased course entitlements")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/course-gate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Act as this signed-in user
  #[arg(short, long)]
  user: Option<UserId>,

  /// Act as a logged-out visitor, ignoring any configured user
  #[arg(long, conflicts_with = "user")]
  logged_out: bool,

  /// Path to the entitlement database
  #[arg(long)]
  db: Option<PathBuf>,

  /// Keep entitlements in memory only
  #[arg(long, conflicts_with = "db")]
  ephemeral: bool,

  /// Log filter (trace, debug, info, warn, error or a RUST_LOG directive)
  #[arg(long)]
  log_level: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Check whether a course is unlocked for the current session
  Check { course: CourseId },
  /// List unlocked courses
  List {
    /// Only read local storage, do not contact the server
    #[arg(long)]
    offline: bool,
  },
  /// Reconcile with the server and report the outcome
  Sync,
  /// Record a completed purchase locally
  Mark { course: CourseId },
  /// Purchase a course through the server
  Buy {
    course: CourseId,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long, default_value_t = 0.0)]
    price: f64,
  },
  /// List orders known to the server
  Orders,
  /// Remove all purchases for the current session
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(args.log_level.as_deref(), config.log_dir.as_deref())?;

  let session = if args.logged_out {
    Session::logged_out()
  } else {
    Session::from(args.user.or(config.session.user_id))
  };
  let session = std::sync::Arc::new(SharedSession::new(session));
  let source = HttpOrderSource::new(&config.server)?;
  let fallback = config.entitlements.read_fallback.clone();

  if args.ephemeral {
    let store = EntitlementStore::new(MemoryStorage::new()).with_read_fallback(fallback);
    let cache = EntitlementCache::new(store, source, session, config.reconcile_options());
    return run(&cache, args.command).await;
  }

  let storage = match args.db.as_ref().or(config.entitlements.database.as_ref()) {
    Some(path) => SqliteStorage::open(path)?,
    None => SqliteStorage::open_default()?,
  };
  let store = EntitlementStore::new(storage).with_read_fallback(fallback);
  let cache = EntitlementCache::new(store, source, session, config.reconcile_options());
  run(&cache, args.command).await
}

async fn run<S: EntitlementStorage + 'static>(
  cache: &EntitlementCache<S, HttpOrderSource>,
  command: Command,
) -> Result<()> {
  match command {
    Command::Check { course } => {
      let unlocked = cache.is_unlocked(course).await;
      println!("{}", if unlocked { "unlocked" } else { "locked" });
    }
    Command::List { offline } => {
      let courses = if offline {
        cache.cached()
      } else {
        cache.resolve().await?.entitlements
      };
      for course in courses {
        println!("{}", course);
      }
    }
    Command::Sync => {
      let mut refresh = cache.refresh();
      let mut tick = tokio::time::interval(Duration::from_millis(50));
      let mut interrupted = false;

      // Ctrl-C stops the remote fetch; local entitlements are left as they were
      while refresh.is_loading() {
        tokio::select! {
          _ = tick.tick() => {
            refresh.poll();
          }
          _ = tokio::signal::ctrl_c(), if !interrupted => {
            refresh.cancel();
            interrupted = true;
          }
        }
      }

      match refresh.state() {
        RefreshState::Done(resolution) => println!(
          "{} ({} merged): {}",
          resolution.source,
          resolution.merged,
          join_ids(resolution.entitlements.iter())
        ),
        RefreshState::Failed(e) => return Err(eyre!("Sync failed: {}", e)),
        RefreshState::Loading => {}
      }
    }
    Command::Mark { course } => {
      if !cache.mark_purchased(course) {
        return Err(eyre!("Purchase of course {} could not be persisted", course));
      }
    }
    Command::Buy {
      course,
      title,
      price,
    } => {
      let order = cache
        .purchase(PurchaseRequest {
          course_id: course,
          course_title: title,
          price,
        })
        .await
        .map_err(|e| eyre!("Purchase failed: {}", e))?;
      println!("purchased course {} (order {})", order.course_id, order.id);
    }
    Command::Orders => {
      let orders = cache
        .orders()
        .await
        .map_err(|e| eyre!("Failed to fetch orders: {}", e))?;
      for order in orders {
        println!(
          "{}\tuser {}\tcourse {}\t{}\t{}",
          order.id,
          order.user_id,
          order.course_id,
          order.course_title.as_deref().unwrap_or("-"),
          order
            .created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
        );
      }
    }
    Command::Clear => {
      cache.clear_all()?;
      println!("cleared");
    }
  }

  Ok(())
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a CourseId>) -> String {
  ids.map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

/// Install the tracing subscriber. Logs go to a daily file when `log_dir` is
/// set, otherwise to stderr so command output stays clean.
fn init_tracing(level: Option<&str>, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = match level {
    Some(level) => EnvFilter::try_new(level)?,
    None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
  };

  if let Some(dir) = log_dir {
    let appender = tracing_appender::rolling::daily(dir, "course-gate.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
      .with(filter)
      .with(
        tracing_subscriber::fmt::layer()
          .with_writer(writer)
          .with_ansi(false),
      )
      .init();
    Ok(Some(guard))
  } else {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init();
    Ok(None)
  }
}
