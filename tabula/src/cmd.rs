use argh::FromArgs;

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
/// Schema reconciliation commands
pub struct SchemaCommand {
    #[argh(subcommand)]
    pub nested: NestedCommand,

    #[argh(switch, short = 'v', long = "verbose")]
    /// enable verbose output
    pub verbose: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand)]
pub enum NestedCommand {
    Plan(PlanCommand),
    Apply(ApplyCommand),
    Forget(ForgetCommand),
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "plan")]
/// Print the ordered operation plan without touching the database
pub struct PlanCommand {
    #[argh(option)]
    /// restrict output to elements owned by this module
    pub module: Option<String>,

    #[argh(switch)]
    /// print the plan as json
    pub json: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "apply")]
/// Apply the plan under the catalog lock
pub struct ApplyCommand {
    #[argh(switch)]
    /// print the per-table report as json
    pub json: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "forget")]
/// Remove a module's whitelist entry; its elements become drop candidates
/// once no other module references them
pub struct ForgetCommand {
    #[argh(positional)]
    /// module to remove
    pub module: String,
}
