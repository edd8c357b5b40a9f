use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracktally_core::{parse_job_path, JobContext, StatesOrdering, TrackObject};
use tracktally_engine::report::{parse_report, DirReportSource};
use tracktally_engine::{render_pass, FrameCountCache};
use tracktally_storage::CountStore;

#[derive(Parser)]
#[command(name = "tracktally")]
#[command(
    about = "Frame-count reconciliation and z-order layering for annotation jobs",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Navigation path of form /tasks/{taskID}/jobs/{jobID}
    #[arg(long)]
    path: String,
    /// Count store database file
    #[arg(long, default_value = "tracktally.db")]
    db: PathBuf,
}

impl Target {
    fn context(&self) -> Result<JobContext> {
        parse_job_path(&self.path)
            .with_context(|| format!("no /tasks/{{id}}/jobs/{{id}} identity in {:?}", self.path))
    }

    fn cache(&self) -> Result<FrameCountCache> {
        let store = CountStore::open(&self.db)
            .with_context(|| format!("failed to open count store at {:?}", self.db))?;
        Ok(FrameCountCache::new(store))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a count report file and print its entries
    Parse {
        /// Report file (T_{taskID}.txt / J_{jobID}.txt format)
        file: PathBuf,
    },
    /// Fetch a namespace's report through the fallback chain and
    /// install the primary table
    Bootstrap {
        #[command(flatten)]
        target: Target,
        /// Directory holding T_*.txt / J_*.txt report files
        #[arg(long)]
        reports: PathBuf,
        /// Allow replacing an existing primary table when the report
        /// digest changed
        #[arg(long)]
        refresh: bool,
    },
    /// Show the persisted tables for a namespace
    Show {
        #[command(flatten)]
        target: Target,
    },
    /// Record one track/frame visit
    Visit {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        client: u64,
        #[arg(long)]
        frame: u64,
    },
    /// Run a full render pass over an object snapshot file and print
    /// the row sequence
    Render {
        #[command(flatten)]
        target: Target,
        /// JSON array of track objects ({"clientID", "frame", "zOrder"?})
        #[arg(long)]
        objects: PathBuf,
        /// Ordering mode: id-ascent, id-descent, updated-time, z-order
        #[arg(long, default_value = "z-order")]
        ordering: String,
        /// Directory holding T_*.txt / J_*.txt report files
        #[arg(long)]
        reports: PathBuf,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Parse { file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("failed to read report {file:?}"))?;
            let entries = parse_report(&text);
            println!("{} entries:", entries.len());
            for entry in entries {
                println!("- track {}: {} frames", entry.client_id, entry.count);
            }
        }
        Commands::Bootstrap {
            target,
            reports,
            refresh,
        } => {
            let context = target.context()?;
            let mut cache = target.cache()?;
            let source = DirReportSource::new(reports);
            let outcome = if refresh {
                cache.refresh_from(&context, &source)?
            } else {
                cache.bootstrap_from(&context, &source)?
            };
            println!("{context}: {outcome:?}");
        }
        Commands::Show { target } => {
            let context = target.context()?;
            let cache = target.cache()?;
            let store = cache.store();

            match store.report_meta(&context)? {
                Some(meta) => println!(
                    "report: digest {} fetched {}",
                    meta.digest, meta.fetched_at
                ),
                None => println!("report: none"),
            }

            print_table("primary", store.primary_counts(&context)?);
            print_table("overflow", store.overflow_counts(&context)?);

            let sets = store.visited_sets(&context)?;
            println!("visited sets: {}", sets.len());
            for (client_id, frames) in sets {
                println!("- track {client_id}: frames {frames:?}");
            }
        }
        Commands::Visit {
            target,
            client,
            frame,
        } => {
            let context = target.context()?;
            let mut cache = target.cache()?;
            let outcome = cache.record_visit(&context, client, frame)?;
            println!("{context} track {client} frame {frame}: {outcome:?}");
        }
        Commands::Render {
            target,
            objects,
            ordering,
            reports,
        } => {
            let ordering: StatesOrdering = ordering.parse().map_err(|err: String| anyhow!(err))?;
            let text = fs::read_to_string(&objects)
                .with_context(|| format!("failed to read objects {objects:?}"))?;
            let snapshot: Vec<TrackObject> =
                serde_json::from_str(&text).context("objects file is not a track array")?;

            let mut cache = target.cache()?;
            let source = DirReportSource::new(reports);
            let ids = sorted_ids(ordering, &snapshot);
            match render_pass(
                &mut cache,
                &target.path,
                ordering,
                &ids,
                &snapshot,
                &source,
            )? {
                Some(rows) => {
                    for row in rows {
                        println!("{row}");
                    }
                }
                None => println!("subsystem disabled: no task/job identity in path"),
            }
        }
    }

    Ok(())
}

fn print_table(name: &str, entries: Option<Vec<tracktally_core::CountEntry>>) {
    match entries {
        Some(entries) => {
            println!("{name} table: {} entries", entries.len());
            for entry in entries {
                println!("- track {}: {} frames", entry.client_id, entry.count);
            }
        }
        None => println!("{name} table: none"),
    }
}

/// Stand-in for the object list's external ordering. The subsystem
/// itself takes an already-sorted sequence; this reproduces the common
/// modes for command-line use. Z-order sorts top layer first, with
/// tracks lacking a z-order inheriting the previous track's layer
/// before the sort so they stay with it.
fn sorted_ids(ordering: StatesOrdering, objects: &[TrackObject]) -> Vec<u64> {
    match ordering {
        StatesOrdering::IdAscent => {
            let mut ids: Vec<u64> = objects.iter().map(|object| object.client_id).collect();
            ids.sort_unstable();
            ids
        }
        StatesOrdering::IdDescent => {
            let mut ids: Vec<u64> = objects.iter().map(|object| object.client_id).collect();
            ids.sort_unstable_by(|a, b| b.cmp(a));
            ids
        }
        StatesOrdering::UpdatedTime => {
            // The data layer hands objects most-recently-updated first.
            objects.iter().map(|object| object.client_id).collect()
        }
        StatesOrdering::ZOrder => {
            let mut current: Option<i64> = None;
            let mut keyed = Vec::with_capacity(objects.len());
            for object in objects {
                current = object.z_order.or(current);
                keyed.push((current.unwrap_or(i64::MIN), object.client_id));
            }
            keyed.sort_by(|a, b| b.0.cmp(&a.0));
            keyed.into_iter().map(|(_, client_id)| client_id).collect()
        }
    }
}
