use crate::credits::{run_grant, run_show, GrantArgs, ShowArgs};
use crate::demo::{run_demo, DemoArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use propsearch::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Property Search",
    about = "Run the credit-metered property search service and its operator tools",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Walk through basic, smart, replayed, and upgraded searches against an in-memory ledger
    Demo(DemoArgs),
    /// Inspect or top up account credits in the configured database
    Credits {
        #[command(subcommand)]
        command: CreditsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CreditsCommand {
    /// Add purchased or renewed credits, opening the account if needed
    Grant(GrantArgs),
    /// Print the balance, recent ledger entries, and an audit of an account
    Show(ShowArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args).await,
        Command::Credits {
            command: CreditsCommand::Grant(args),
        } => run_grant(args).await,
        Command::Credits {
            command: CreditsCommand::Show(args),
        } => run_show(args).await,
    }
}
