use tabula::cmd::{ApplyCommand, ForgetCommand, NestedCommand, PlanCommand, SchemaCommand};
use tabula::db::PgStore;
use tabula::schema::{
    Ledger, Operation, StoreError, TableStatus, load_contributions,
};
use tabula::{
    ApplyOutcome, Conf, EXIT_OK, EXIT_PARTIAL, ReconcileError, Reconciler,
};

#[tokio::main]
async fn main() {
    let cmd: SchemaCommand = argh::from_env();
    init_tracing(cmd.verbose);

    let conf = Conf::from_env();
    let code = match run(&conf, cmd).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "reconciliation failed");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "tabula=debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(conf: &Conf, cmd: SchemaCommand) -> Result<i32, ReconcileError> {
    match cmd.nested {
        NestedCommand::Plan(args) => run_plan(conf, args).await,
        NestedCommand::Apply(args) => run_apply(conf, args).await,
        NestedCommand::Forget(args) => run_forget(conf, args),
    }
}

async fn run_plan(conf: &Conf, args: PlanCommand) -> Result<i32, ReconcileError> {
    let contributions = load_contributions(&conf.declarations_dir)?;
    let ledger = Ledger::load_dir(&conf.whitelist_dir)?;
    let store = PgStore::connect(conf).await.map_err(StoreError::from)?;

    let mut reconciler = Reconciler::new(store, contributions, ledger);
    let outcome = reconciler.plan().await?;

    // The plan is always computed over the full logical schema so ordering
    // stays correct; --module only narrows what gets printed.
    let operations: Vec<&Operation> = outcome
        .plan
        .operations()
        .filter(|op| match &args.module {
            Some(module) => {
                let id = op.element_id();
                outcome.logical.is_owned_by(&id, module)
                    || reconciler.ledger().owning_modules(&id).contains(module)
            }
            None => true,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&operations).expect("plan serialization"));
    } else if operations.is_empty() {
        println!("schema is up to date");
    } else {
        for op in &operations {
            println!("{op}");
        }
    }

    for element in &outcome.untracked {
        tracing::warn!(%element, "left untouched: not declared and not whitelisted");
    }

    Ok(EXIT_OK)
}

async fn run_apply(conf: &Conf, args: ApplyCommand) -> Result<i32, ReconcileError> {
    let contributions = load_contributions(&conf.declarations_dir)?;
    let ledger = Ledger::load_dir(&conf.whitelist_dir)?;
    let store = PgStore::connect(conf).await.map_err(StoreError::from)?;

    let mut reconciler = Reconciler::new(store, contributions, ledger);
    let outcome = reconciler.apply().await?;
    reconciler.ledger().save_dir(&conf.whitelist_dir)?;

    match outcome {
        ApplyOutcome::UpToDate => {
            println!("schema is up to date");
            Ok(EXIT_OK)
        }
        ApplyOutcome::Applied { report, untracked } => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).expect("report serialization")
                );
            } else {
                for table in &report.tables {
                    match &table.status {
                        TableStatus::Applied => println!(
                            "{}: applied ({} operations)",
                            table.table, table.operations_applied
                        ),
                        TableStatus::NoChange => println!("{}: up to date", table.table),
                        TableStatus::Failed { reason } => {
                            println!("{}: FAILED ({reason})", table.table)
                        }
                        TableStatus::Skipped { blocked_on } => {
                            println!("{}: skipped (blocked on {blocked_on})", table.table)
                        }
                    }
                }
            }
            for element in &untracked {
                tracing::warn!(%element, "left untouched: not declared and not whitelisted");
            }
            if report.fully_applied() {
                Ok(EXIT_OK)
            } else {
                tracing::warn!("apply finished partially; re-run after remediation");
                Ok(EXIT_PARTIAL)
            }
        }
    }
}

fn run_forget(conf: &Conf, args: ForgetCommand) -> Result<i32, ReconcileError> {
    let mut ledger = Ledger::load_dir(&conf.whitelist_dir)?;
    match ledger.forget(&args.module) {
        Some(entry) => {
            ledger.save_dir(&conf.whitelist_dir)?;
            println!(
                "forgot {} ({} elements become drop candidates unless co-owned)",
                args.module,
                entry.installed.len()
            );
        }
        None => println!("no whitelist entry for {}", args.module),
    }
    Ok(EXIT_OK)
}
