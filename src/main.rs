use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use housing_reconcile::alerts::AlertResolver;
use housing_reconcile::backfill::{self, Assignment, Backfill, FieldRule};
use housing_reconcile::config::{Settings, Stage, CONFIG_ENV_VAR};
use housing_reconcile::crossref::{AlertCrossRef, DEFAULT_ALERT_QUERY};
use housing_reconcile::db::{
    import_into_index, import_into_table, insert_event, load_json_items, open_database,
    patched_record_ids, query_records, SqliteIndex, SqliteTable,
};
use housing_reconcile::fixups::{self, FixupApplier, FixupPlanner};
use housing_reconcile::patch::{AssumeYes, Confirm, ConsolePrompt, PatchApplier, PatchEvent, WriteMode};
use housing_reconcile::progress::ProgressReporter;
use housing_reconcile::reconciliation::TenureCrossCheck;
use housing_reconcile::store::SecondaryIndex;
use housing_reconcile::tabular::{self, ExportSpec, Sheet, TextFormat};
use housing_reconcile::{FieldUpdates, VersionedRecord};
use rusqlite::Connection;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cross-store reconciliation for housing records
#[derive(Parser, Debug)]
#[command(name = "housing-reconcile")]
#[command(about = "Detect and fix drift between housing tables and search indexes")]
#[command(version)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment to run against
    #[arg(long, global = true, value_enum, default_value_t = Stage::HousingDevelopment, env = "HOUSING_RECONCILE_STAGE")]
    stage: Stage,

    /// Database file, overriding the settings
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Also append log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare a tenure against the copies held by its asset and household members
    Crosscheck {
        tenure_id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build a reviewable fixup plan from a tenancies TSV
    PlanFixups {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Apply a reviewed fixup plan
    ApplyFixups {
        #[arg(long)]
        plan: PathBuf,

        /// Also patch the asset search index
        #[arg(long)]
        search: bool,

        /// Do not prompt before each write
        #[arg(long)]
        yes: bool,

        /// Overwrite even if the record changed since it was read
        #[arg(long)]
        unconditional: bool,
    },

    /// Check that a fixup plan has landed in both stores
    VerifyFixups {
        #[arg(long)]
        plan: PathBuf,
    },

    /// Set fields on every record of a table that matches the filters
    Backfill {
        #[arg(long)]
        table: String,

        /// path=value to write; the value is parsed as JSON when it can be
        #[arg(long = "set", required = true)]
        set: Vec<Assignment>,

        /// path=value a record must already hold to be patched
        #[arg(long = "where")]
        filters: Vec<Assignment>,

        #[command(flatten)]
        write: WriteArgs,
    },

    /// Fill in blank asset isActive flags from the tenure end date
    SetIsActive {
        #[command(flatten)]
        write: WriteArgs,
    },

    /// Resolve cautionary alerts to person ids
    ResolveAlerts {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Check relational alert rows against the alerted person's active tenure
    CrossrefAlerts {
        /// SQL selecting alert_id, mmh_id and property_reference columns
        #[arg(long, default_value = DEFAULT_ALERT_QUERY)]
        query: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export table columns to CSV or TSV
    Export {
        #[arg(long)]
        table: String,

        /// Comma-separated dotted paths
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,

        #[arg(long)]
        output: PathBuf,

        #[arg(long)]
        tsv: bool,

        /// Skip rows where any of these columns is empty
        #[arg(long, value_delimiter = ',')]
        require: Vec<String>,
    },

    /// Load a JSON array of items into a table or search index
    #[command(group(ArgGroup::new("target").required(true).args(["table", "index"])))]
    Import {
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        index: Option<String>,
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct WriteArgs {
    /// Do not prompt before each write
    #[arg(long)]
    yes: bool,

    /// Overwrite even if the record changed since it was read
    #[arg(long)]
    unconditional: bool,

    /// Skip records the patch journal already holds for this table
    #[arg(long)]
    resume: bool,
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "housing_reconcile=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

struct RunContext {
    stage: Stage,
    settings: Settings,
    conn: Connection,
}

impl RunContext {
    fn table(&self, name: &str) -> SqliteTable<'_> {
        SqliteTable::new(&self.conn, name).with_page_size(self.settings.page_size)
    }

    fn assets(&self) -> SqliteTable<'_> {
        self.table(&self.settings.tables.assets)
            .with_index(&self.settings.asset_index)
    }

    fn asset_index(&self) -> SecondaryIndex {
        self.settings.asset_index.clone()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.stage.is_read_only() {
            bail!("Stage {} is read-only", self.stage);
        }
        Ok(())
    }

    fn patcher(&self, unconditional: bool) -> PatchApplier {
        let actor = std::env::var("USER").unwrap_or_else(|_| "housing-reconcile".to_string());
        let mode = if unconditional {
            WriteMode::Unconditional
        } else {
            WriteMode::Conditional
        };
        PatchApplier::new(actor).with_mode(mode)
    }

    fn confirmer(&self, yes: bool) -> Box<dyn Confirm> {
        if yes {
            Box::new(AssumeYes)
        } else {
            Box::new(ConsolePrompt::stdio())
        }
    }

    fn journal(&self, events: &[PatchEvent]) -> Result<()> {
        for event in events {
            insert_event(&self.conn, event)?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let working_dir = std::env::current_dir().context("Failed to read working directory")?;
    let env_config = std::env::var(CONFIG_ENV_VAR).ok();
    let settings = Settings::resolve(cli.config.as_deref(), env_config.as_deref(), &working_dir)?;

    let db_path = cli.db.clone().unwrap_or_else(|| settings.database_path(cli.stage));
    info!("Stage {} ({}) using {}", cli.stage, cli.stage.env_name(), db_path.display());
    let conn = open_database(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let ctx = RunContext {
        stage: cli.stage,
        settings,
        conn,
    };

    match cli.command {
        Command::Crosscheck { tenure_id, json } => run_crosscheck(&ctx, &tenure_id, json),
        Command::PlanFixups { input, output } => run_plan_fixups(&ctx, &input, &output),
        Command::ApplyFixups {
            plan,
            search,
            yes,
            unconditional,
        } => run_apply_fixups(&ctx, &plan, search, yes, unconditional),
        Command::VerifyFixups { plan } => run_verify_fixups(&ctx, &plan),
        Command::Backfill {
            table,
            set,
            filters,
            write,
        } => {
            let rule = FieldRule { set, filters };
            run_backfill(&ctx, &table, &write, |record| Ok(rule.updates_for(record)))
        }
        Command::SetIsActive { write } => {
            let today = chrono::Local::now().date_naive();
            let table = ctx.settings.tables.assets.clone();
            run_backfill(&ctx, &table, &write, |record| backfill::is_active_update(record, today))
        }
        Command::ResolveAlerts { input, output } => run_resolve_alerts(&ctx, &input, &output),
        Command::CrossrefAlerts { query, json } => run_crossref_alerts(&ctx, &query, json),
        Command::Export {
            table,
            columns,
            output,
            tsv,
            require,
        } => run_export(&ctx, &table, columns, &output, tsv, require),
        Command::Import {
            table,
            index,
            input,
        } => run_import(&ctx, table, index, &input),
    }
}

fn run_crosscheck(ctx: &RunContext, tenure_id: &str, json: bool) -> Result<()> {
    let tenures = ctx.table(&ctx.settings.tables.tenures);
    let assets = ctx.assets();
    let persons = ctx.table(&ctx.settings.tables.persons);

    let report = TenureCrossCheck {
        tenures: &tenures,
        assets: &assets,
        persons: &persons,
    }
    .run(tenure_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", report.summary());
    for mismatch in &report.mismatches {
        println!("  ✗ {}", mismatch);
    }
    for unresolved in &report.unresolved {
        println!("  ? {}", unresolved);
    }
    if report.is_consistent() {
        println!("  ✓ consistent");
    }
    Ok(())
}

fn run_plan_fixups(ctx: &RunContext, input: &Path, output: &Path) -> Result<()> {
    let rows = fixups::read_tenancy_rows(
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
    )?;
    let assets = ctx.assets();
    let tenures = ctx.table(&ctx.settings.tables.tenures);
    let tenure_search = SqliteIndex::new(&ctx.conn, ctx.settings.search_indexes.tenures.as_str());

    let reporter = ProgressReporter::new(rows.len(), ctx.settings.progress_every);
    let plan = FixupPlanner {
        assets: &assets,
        tenures: &tenures,
        tenure_search: &tenure_search,
        asset_index: ctx.asset_index(),
    }
    .plan(&rows, Some(&reporter))?;

    fixups::write_plan(output, &plan.fixups)?;
    for skipped in &plan.skipped {
        println!("  skipped {}: {}", skipped.prop_ref, skipped.reason);
    }
    println!(
        "{} fixup(s) written to {} - review before running apply-fixups",
        plan.fixups.len(),
        output.display()
    );
    Ok(())
}

fn run_apply_fixups(ctx: &RunContext, plan: &Path, search: bool, yes: bool, unconditional: bool) -> Result<()> {
    ctx.ensure_writable()?;
    let fixups = fixups::read_plan(plan)
        .with_context(|| format!("Failed to read plan {}", plan.display()))?;

    let patcher = ctx.patcher(unconditional);
    let applier = FixupApplier { patcher: &patcher };
    let mut confirm = ctx.confirmer(yes);

    let assets = ctx.assets();
    let table_report = applier.apply_to_table(&assets, &fixups, confirm.as_mut())?;
    ctx.journal(&table_report.events)?;
    println!("{}: {}", ctx.settings.tables.assets, table_report.tally.summary());

    if search {
        if confirm.confirm("Update the asset search index with the same changes?") {
            let index = SqliteIndex::new(&ctx.conn, ctx.settings.search_indexes.assets.as_str());
            let index_report = applier.apply_to_index(&index, &fixups, confirm.as_mut())?;
            ctx.journal(&index_report.events)?;
            println!("{}: {}", ctx.settings.search_indexes.assets, index_report.tally.summary());
        } else {
            warn!("Search index left unchanged; it now disagrees with the asset table");
        }
    }
    Ok(())
}

fn run_backfill<R>(ctx: &RunContext, table: &str, write: &WriteArgs, rule: R) -> Result<()>
where
    R: FnMut(&VersionedRecord) -> housing_reconcile::Result<Option<FieldUpdates>>,
{
    ctx.ensure_writable()?;
    let store = ctx.table(table);
    let patcher = ctx.patcher(write.unconditional);
    let mut confirm = ctx.confirmer(write.yes);

    let mut pass = Backfill::new(&patcher).with_journal(&ctx.conn);
    if write.resume {
        pass = pass.resume_after(patched_record_ids(&ctx.conn, table)?);
    }

    let reporter = ProgressReporter::new(store.count()?, ctx.settings.progress_every);
    let report = pass
        .run(&store, rule, confirm.as_mut(), Some(&reporter))
        .with_context(|| format!("Backfill of {} stopped", table))?;
    println!("{}: {}", table, report.tally.summary());
    Ok(())
}

fn run_verify_fixups(ctx: &RunContext, plan: &Path) -> Result<()> {
    let fixups = fixups::read_plan(plan)
        .with_context(|| format!("Failed to read plan {}", plan.display()))?;
    let assets = ctx.assets();
    let index = SqliteIndex::new(&ctx.conn, ctx.settings.search_indexes.assets.as_str());

    let findings = fixups::verify(&assets, Some(&index), &fixups)?;
    let failures = findings.iter().filter(|f| !f.is_warning()).count();
    for finding in &findings {
        println!("  {}", finding);
    }
    if failures > 0 {
        bail!("{} of {} fixup(s) did not land", failures, fixups.len());
    }
    println!("All {} fixup(s) verified", fixups.len());
    Ok(())
}

fn run_resolve_alerts(ctx: &RunContext, input: &Path, output: &Path) -> Result<()> {
    let mut sheet = Sheet::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let assets = ctx.assets();
    let tenures = ctx.table(&ctx.settings.tables.tenures);

    let reporter = ProgressReporter::new(sheet.rows.len(), ctx.settings.progress_every);
    let tally = AlertResolver::new(&assets, &tenures, ctx.asset_index())?
        .resolve_sheet(&mut sheet, Some(&reporter))?;

    sheet.write(output)?;
    println!("{} -> {}: {}", input.display(), output.display(), tally.summary());
    Ok(())
}

fn run_crossref_alerts(ctx: &RunContext, query: &str, json: bool) -> Result<()> {
    let rows = query_records(&ctx.conn, query, []).context("Alert query failed")?;
    let persons = ctx.table(&ctx.settings.tables.persons);
    let reporter = ProgressReporter::new(rows.len(), ctx.settings.progress_every);

    let report = AlertCrossRef {
        persons: &persons,
        today: chrono::Local::now().date_naive(),
    }
    .check(&rows, Some(&reporter))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for mismatch in &report.mismatches {
        println!("  ✗ {}", mismatch);
    }
    for unresolved in &report.unresolved {
        println!("  ? {}", unresolved);
    }
    println!("{}", report.tally.summary());
    Ok(())
}

fn run_export(
    ctx: &RunContext,
    table: &str,
    columns: Vec<String>,
    output: &Path,
    tsv: bool,
    require: Vec<String>,
) -> Result<()> {
    let store = ctx.table(table);
    let format = if tsv { TextFormat::Tsv } else { TextFormat::from_path(output) };
    let reporter = ProgressReporter::new(store.count()?, ctx.settings.progress_every);

    let spec = ExportSpec {
        columns,
        required: require,
    };
    let file = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    let summary = tabular::export_store(&store, &spec, file, format, Some(&reporter))?;

    println!(
        "Exported {} of {} row(s) from {} to {}",
        summary.written,
        summary.scanned,
        table,
        output.display()
    );
    Ok(())
}

fn run_import(ctx: &RunContext, table: Option<String>, index: Option<String>, input: &Path) -> Result<()> {
    ctx.ensure_writable()?;
    let items = load_json_items(input)?;

    let imported = match (table, index) {
        (Some(table), _) => import_into_table(&ctx.table(&table), items)?,
        (None, Some(index)) => import_into_index(&SqliteIndex::new(&ctx.conn, index.as_str()), items)?,
        (None, None) => bail!("Either --table or --index is required"),
    };
    println!("Imported {} item(s) from {}", imported, input.display());
    Ok(())
}
