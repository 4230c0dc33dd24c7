use admin_ipc::{send_request, AdminRequest, DEFAULT_SOCKET_PATH};
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Status,
    /// Skip cycles for one target, or all of them.
    Pause {
        #[arg(long)]
        target: Option<String>,
    },
    Resume {
        #[arg(long)]
        target: Option<String>,
    },
}

impl From<Command> for AdminRequest {
    fn from(command: Command) -> Self {
        match command {
            Command::Status => AdminRequest::Status,
            Command::Pause { target } => AdminRequest::Pause { target },
            Command::Resume { target } => AdminRequest::Resume { target },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let req = AdminRequest::from(cli.command);

    let resp = send_request(&cli.socket, &req).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}
