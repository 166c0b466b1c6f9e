use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use hostsync_core::Row;
use hostsync_inventory::{InventoryService, MemoryInventory, RestInventory};
use hostsync_sync::{
    ExportOptions, ExportTable, ExportWalker, ImportOptions, ImportRun, ImportSummary, Settings,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hostsync-cli")]
#[command(about = "Import or export content hosts against a subscription-management service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import or export content hosts
    ContentHosts(ContentHostsArgs),
}

#[derive(Debug, Clone, Args)]
struct ContentHostsArgs {
    /// Export instead of import
    #[arg(long)]
    export: bool,
    /// CSV file to read (import) or write (export); stdin/stdout when omitted
    #[arg(long)]
    file: Option<PathBuf>,
    /// Export one subscription per row; on import only update subscriptions
    #[arg(long)]
    itemized_subscriptions: bool,
    /// With --itemized-subscriptions, clear existing subscriptions first
    #[arg(long)]
    clear_subscriptions: bool,
    /// Comma separated list of column names to export
    #[arg(long, value_delimiter = ',')]
    columns: Option<Vec<String>>,
    /// Only process this organization
    #[arg(long)]
    organization: Option<String>,
    /// Host search expression applied to every listing
    #[arg(long)]
    search: Option<String>,
    /// Rows processed concurrently during import
    #[arg(long, default_value_t = 1)]
    threads: usize,
    #[arg(long, short)]
    verbose: bool,
    /// YAML column settings (defaults to $HOSTSYNC_SETTINGS)
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Run against a JSON inventory fixture instead of the REST service
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ContentHosts(args) => {
            init_tracing(args.verbose);
            let inventory = open_inventory(args.fixture.as_deref())?;
            if args.export {
                let table = export(inventory, &args).await?;
                if args.file.is_some() {
                    println!(
                        "export complete: hosts={} rows={} warnings={}",
                        table.hosts,
                        table.rows.len(),
                        table.warnings.len()
                    );
                }
            } else {
                let summary = import(inventory, &args).await?;
                println!("import complete: run_id={} {summary}", summary.run_id);
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::INFO } else { Level::WARN };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_inventory(fixture: Option<&Path>) -> Result<Arc<dyn InventoryService>> {
    Ok(match fixture {
        Some(path) => Arc::new(MemoryInventory::from_fixture_file(path)?),
        None => Arc::new(RestInventory::from_env().context("configuring inventory client")?),
    })
}

fn read_rows(input: impl Read) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);
    let headers = reader.headers().context("reading CSV header")?.clone();
    reader
        .records()
        .enumerate()
        .map(|(index, record)| {
            let record = record.with_context(|| format!("reading CSV line {}", index + 2))?;
            Ok(headers.iter().zip(record.iter()).collect::<Row>())
        })
        .collect()
}

fn write_table(table: &ExportTable, output: impl Write) -> Result<()> {
    let mut writer = csv::Writer::from_writer(output);
    writer.write_record(&table.columns).context("writing CSV header")?;
    for row in &table.rows {
        writer.write_record(row).context("writing CSV row")?;
    }
    writer.flush().context("flushing CSV output")?;
    Ok(())
}

async fn import(inventory: Arc<dyn InventoryService>, args: &ContentHostsArgs) -> Result<ImportSummary> {
    let options = ImportOptions {
        itemized_subscriptions: args.itemized_subscriptions,
        clear_subscriptions: args.clear_subscriptions,
        organization: args.organization.clone(),
        search: args.search.clone(),
        columns: args.columns.clone(),
    };
    let run = Arc::new(ImportRun::new(inventory, options)?);
    let rows = match &args.file {
        Some(path) => read_rows(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )?,
        None => read_rows(io::stdin().lock())?,
    };
    info!(run_id = %run.run_id(), rows = rows.len(), "starting import");

    let mut summary = ImportSummary::new(run.run_id());
    let mut fatal = None;
    let semaphore = Arc::new(Semaphore::new(args.threads.max(1)));
    let mut tasks = JoinSet::new();
    for (index, row) in rows.into_iter().enumerate() {
        while let Some(joined) = tasks.try_join_next() {
            collect(joined, &mut summary, &mut fatal)?;
        }
        if fatal.is_some() {
            break;
        }
        let permit = semaphore.clone().acquire_owned().await?;
        let run = run.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let result = run.process_row(&row).await;
            (index + 2, row.key(), result)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        collect(joined, &mut summary, &mut fatal)?;
    }
    if let Some(err) = fatal {
        return Err(anyhow::Error::new(err).context("import aborted"));
    }

    let run = Arc::try_unwrap(run).map_err(|_| anyhow!("import rows still in flight"))?;
    let report = run.finalize().await.context("updating hypervisor guests")?;
    summary.finish(report);
    Ok(summary)
}

type RowResult = (usize, String, Result<hostsync_sync::RowOutcome, hostsync_sync::ReconcileError>);

/// Row-scoped failures are logged and counted; anything else stops the run.
fn collect(
    joined: Result<RowResult, tokio::task::JoinError>,
    summary: &mut ImportSummary,
    fatal: &mut Option<hostsync_sync::ReconcileError>,
) -> Result<()> {
    let (line, key, result) = joined.context("row task panicked")?;
    match result {
        Ok(outcome) => summary.record(&outcome),
        Err(err) if err.is_row_scoped() => {
            error!(line, row = %key, error = %err, "row failed");
            summary.record_failure();
        }
        Err(err) => {
            error!(line, row = %key, error = %err, "remote failure");
            summary.record_failure();
            fatal.get_or_insert(err);
        }
    }
    Ok(())
}

async fn export(inventory: Arc<dyn InventoryService>, args: &ContentHostsArgs) -> Result<ExportTable> {
    let settings = Settings::resolve(args.settings.clone())?;
    let options = ExportOptions {
        itemized_subscriptions: args.itemized_subscriptions,
        clear_subscriptions: args.clear_subscriptions,
        columns: args.columns.clone(),
        organization: args.organization.clone(),
        search: args.search.clone(),
        ..Default::default()
    }
    .with_settings(&settings);
    let walker = ExportWalker::new(inventory, options)?;
    let table = walker.export().await?;

    match &args.file {
        Some(path) => write_table(
            &table,
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )?,
        None => write_table(&table, io::stdout().lock())?,
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(extra: &[&str]) -> ContentHostsArgs {
        let argv = ["hostsync-cli", "content-hosts"].iter().chain(extra);
        match Cli::try_parse_from(argv).expect("args").command {
            Commands::ContentHosts(args) => args,
        }
    }

    fn fixture_inventory() -> Arc<dyn InventoryService> {
        let fixture = serde_json::from_value(json!({
            "organizations": [{"id": 1, "name": "ACME"}],
            "hosts": [{"id": 2, "name": "esx01", "organization_id": 1, "organization_name": "ACME",
                       "subscription_facet_attributes": {"uuid": "c-2"}}]
        }))
        .expect("fixture");
        Arc::new(MemoryInventory::new(fixture).expect("inventory"))
    }

    #[test]
    fn columns_split_on_commas() {
        let parsed = args(&["--export", "--columns", "Name,Organization", "--threads", "4"]);
        assert!(parsed.export);
        assert_eq!(
            parsed.columns,
            Some(vec!["Name".to_string(), "Organization".to_string()])
        );
        assert_eq!(parsed.threads, 4);
    }

    #[test]
    fn rows_keep_header_names() {
        let rows = read_rows("Name,Organization,Count\nweb%d,ACME,2\ndb,ACME,\n".as_bytes())
            .expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name"), Some("web%d"));
        assert_eq!(rows[1].get("Count"), None);
    }

    #[tokio::test]
    async fn import_then_export_through_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("hosts.csv");
        std::fs::write(
            &input,
            "Name,Organization,Virtual,Guest of Host,OS\nvm1,ACME,Yes,esx01,RHEL 7.2\nvm2,ACME,Yes,esx01,RHEL 7.2\n",
        )
        .expect("write csv");
        let inventory = fixture_inventory();

        let import_args = args(&["--file", input.to_str().expect("path")]);
        let summary = import(inventory.clone(), &import_args).await.expect("import");
        assert_eq!((summary.created, summary.failed), (2, 0));
        assert_eq!(summary.hypervisors_updated, 1);

        let output = dir.path().join("export.csv");
        let export_args = args(&[
            "--export",
            "--columns",
            "Name,Guest of Host,OS",
            "--file",
            output.to_str().expect("path"),
        ]);
        export(inventory, &export_args).await.expect("export");
        let written = std::fs::read_to_string(&output).expect("read export");
        assert_eq!(
            written,
            "Name,Guest of Host,OS\nesx01,,\nvm1,esx01,RHEL 7.2\nvm2,esx01,RHEL 7.2\n"
        );
    }

    #[tokio::test]
    async fn row_failures_do_not_stop_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("hosts.csv");
        std::fs::write(
            &input,
            "Name,Organization,Virtual,Guest of Host\norphan,ACME,Yes,nowhere\nok,ACME,No,\n",
        )
        .expect("write csv");

        let summary = import(fixture_inventory(), &args(&["--file", input.to_str().expect("path")]))
            .await
            .expect("import");
        assert_eq!((summary.rows, summary.created, summary.failed), (2, 1, 1));
    }

    #[tokio::test]
    async fn columns_are_rejected_on_import() {
        let err = import(fixture_inventory(), &args(&["--columns", "Name"]))
            .await
            .expect_err("precondition");
        assert!(err.to_string().contains("--columns"));
    }
}
