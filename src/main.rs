use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use ontosync::cache::{OrderBy, WhereClause};
use ontosync::ontology::ObjectSetDefinition;
use ontosync::{
  AggregationOptions, ApplyActionOptions, Config, HttpDataSource, ListOptions, ObjectHolder, ObservableClient,
  PrimaryKey,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ontosync")]
#[command(about = "Inspect an ontology through the ontosync cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ontosync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load one object by primary key
  Object { object_type: String, primary_key: String },
  /// List objects of a type
  List {
    object_type: String,
    /// Where clause as JSON, e.g. '{"name": {"$startsWith": "A"}}'
    #[arg(short, long)]
    r#where: Option<String>,
    /// Sort field; prefix with '-' for descending. Repeatable.
    #[arg(short, long)]
    order_by: Vec<String>,
    #[arg(long)]
    page_size: Option<usize>,
    /// Follow page tokens until the list is complete
    #[arg(long)]
    all: bool,
  },
  /// Aggregate objects of a type
  Aggregate {
    object_type: String,
    /// Aggregation spec as JSON
    spec: String,
    #[arg(short, long)]
    r#where: Option<String>,
  },
  /// Apply (or validate) an action
  Apply {
    action: String,
    /// Action parameters as JSON
    #[arg(default_value = "{}")]
    args: String,
    #[arg(long)]
    validate: bool,
  },
  /// Print a list every time it changes
  Watch {
    object_type: String,
    #[arg(short, long)]
    r#where: Option<String>,
  },
}

fn parse_json(what: &str, raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid {} JSON: {}", what, e))
}

fn parse_where(raw: Option<&str>) -> Result<WhereClause> {
  match raw {
    Some(raw) => Ok(WhereClause::from_json(&parse_json("where", raw)?)?),
    None => Ok(WhereClause::all()),
  }
}

fn parse_order_by(fields: &[String]) -> OrderBy {
  fields.iter().fold(OrderBy::new(), |order, f| match f.strip_prefix('-') {
    Some(field) => order.desc(field),
    None => order.asc(f.as_str()),
  })
}

fn print_objects(objects: &[ObjectHolder]) -> Result<()> {
  let data: Vec<_> = objects.iter().map(|o| &**o).collect();
  println!("{}", serde_json::to_string_pretty(&data)?);
  Ok(())
}

/// Log to a daily file under the data dir so stdout only carries results.
fn init_logging() -> Option<WorkerGuard> {
  let dir = dirs::data_local_dir()?.join("ontosync").join("logs");
  std::fs::create_dir_all(&dir).ok()?;
  let appender = tracing_appender::rolling::daily(dir, "ontosync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("ONTOSYNC_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .init();
  Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_logging();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let remote = Arc::new(HttpDataSource::from_config(&config)?);
  let client = ObservableClient::new(remote, config.store_config());
  let _gc = client.spawn_gc();

  match args.command {
    Command::Object {
      object_type,
      primary_key,
    } => {
      let query = client.object(&object_type, PrimaryKey::parse_lenient(&primary_key))?;
      let object = query.fetch().await?;
      println!("{}", serde_json::to_string_pretty(&*object)?);
    }
    Command::List {
      object_type,
      r#where,
      order_by,
      page_size,
      all,
    } => {
      let mut options = ListOptions::new(object_type)
        .filter(parse_where(r#where.as_deref())?)
        .order_by(parse_order_by(&order_by));
      if let Some(size) = page_size {
        options = options.page_size(size);
      }
      let query = client.list(options)?;
      query.fetch().await?;
      while all && query.has_more() {
        query.fetch_more().await?;
      }
      print_objects(&query.current()?)?;
    }
    Command::Aggregate {
      object_type,
      spec,
      r#where,
    } => {
      let options = AggregationOptions::new(ObjectSetDefinition::base(object_type), parse_json("spec", &spec)?)
        .filter(parse_where(r#where.as_deref())?);
      let result = client.aggregation(options)?.fetch().await?;
      println!("{}", serde_json::to_string_pretty(&*result)?);
    }
    Command::Apply {
      action,
      args,
      validate,
    } => {
      let args = parse_json("args", &args)?;
      if validate {
        let result = client.validate_action(&action, &args).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
      } else {
        let edits = client
          .apply_action(&action, args, ApplyActionOptions::default())
          .await?;
        println!("{:#?}", edits);
      }
    }
    Command::Watch { object_type, r#where } => {
      let query = client.list(ListOptions::new(object_type).filter(parse_where(r#where.as_deref())?))?;
      let mut sub = query.subscribe()?;
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          changed = sub.changed() => {
            let snapshot = changed?;
            if let Some(e) = snapshot.error() {
              eprintln!("error: {}", e);
            } else if snapshot.status().is_loaded() {
              print_objects(&sub.objects())?;
            }
          }
        }
      }
    }
  }

  Ok(())
}
