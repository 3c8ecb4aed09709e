//! Command implementations for the nrtbench CLI.

use std::time::Duration;

use log::info;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::{CoordinatorConfig, positive_secs};
use crate::coordinator::{Collaborators, Coordinator};
use crate::document::{DocumentSource, GeneratedSource, GeneratedSourceConfig, LineFileSource};
use crate::error::Result;
use crate::storage::{FileStorageConfig, StorageConfig};
use crate::task::{TaskLog, TaskScheduler};

/// Execute a CLI command.
pub fn execute_command(args: NrtbenchArgs) -> Result<()> {
    match &args.command {
        Command::Run(run_args) => run(run_args, &args),
        Command::Tasks(tasks_args) => list_tasks(tasks_args, &args),
    }
}

/// Configuration from the file named by `args`, with flags applied on top.
pub fn build_config(args: &RunArgs) -> Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => CoordinatorConfig::default(),
    };

    if let Some(threads) = args.threads {
        config.ingestion_thread_count = threads;
    }
    if let Some(rate) = args.rate {
        config.records_per_second_per_thread = rate;
    }
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if args.max_records.is_some() {
        config.max_records = args.max_records;
    }
    if let Some(interval) = args.refresh_interval {
        config.refresh_interval_secs = interval;
    }
    if let Some(workers) = args.task_workers {
        config.task_worker_count = workers;
    }
    if !args.categories.is_empty() {
        config.task_categories = args.categories.clone();
    }
    if let Some(seed) = args.seed {
        config.random_seed = seed;
    }
    if let Some(merges) = args.max_concurrent_merges {
        config.max_concurrent_merges = merges;
    }
    if let Some(queued) = args.max_queued_merges {
        config.max_queued_merges = queued;
    }
    if args.no_warm {
        config.warm_on_merge = false;
    }
    if let Some(dir) = &args.index_dir {
        let mut storage = FileStorageConfig::new(dir);
        storage.use_mmap = args.mmap;
        config.storage = StorageConfig::File(storage);
    }

    config.validate()?;
    Ok(config)
}

/// Run length and progress interval, checked before anything starts.
fn run_timing(args: &RunArgs) -> Result<(Duration, Duration)> {
    let duration = positive_secs("--duration", args.duration)?;
    let progress = positive_secs("--progress", args.progress)?;
    Ok((duration, progress))
}

fn run(args: &RunArgs, cli_args: &NrtbenchArgs) -> Result<()> {
    let (duration, progress) = run_timing(args)?;
    let config = build_config(args)?;
    let task_log = TaskLog::load(&args.tasks)?;

    let source: Box<dyn DocumentSource> = match &args.docs {
        Some(path) => Box::new(LineFileSource::open(path, args.repeat_docs)?),
        None => Box::new(GeneratedSource::new(GeneratedSourceConfig {
            seed: config.random_seed,
            ..GeneratedSourceConfig::default()
        })?),
    };

    let coordinator = Coordinator::start(
        config,
        Collaborators {
            storage: None,
            source,
            task_log,
        },
    )?;
    info!("running for {:.1}s", args.duration);
    coordinator.wait(duration, progress);
    let report = coordinator.stop()?;

    output_result(&report, cli_args)
}

fn list_tasks(args: &TasksArgs, cli_args: &NrtbenchArgs) -> Result<()> {
    let log = TaskLog::load(&args.tasks)?;
    let scheduler = TaskScheduler::new(&log, args.seed, args.tasks_per_category)?;

    let categories = match &args.category {
        Some(category) => vec![category.clone()],
        None => scheduler.categories().to_vec(),
    };
    let categories = categories
        .into_iter()
        .map(|category| {
            let tasks = (0..args.count)
                .map(|_| scheduler.next_task(&category).map(|task| task.text().to_string()))
                .collect::<Result<Vec<_>>>()?;
            Ok(CategoryListing { category, tasks })
        })
        .collect::<Result<Vec<_>>>()?;

    output_result(
        &TaskListing {
            seed: args.seed,
            categories,
        },
        cli_args,
    )
}
