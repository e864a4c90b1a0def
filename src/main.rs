use clap::Parser;

use agent_virt::cli::{Cli, Command};
use agent_virt::{commands, config, logging};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let file_handle = logging::init(cli.verbose);

    let settings = config::load_settings()?;

    // Per-VM log file for commands that bring a VM up
    if let Some(name) = cli.command.logged_vm()
        && config::validate_name(name).is_ok()
    {
        file_handle.set_file(&settings.layout.log_file(name)).ok();
    }

    match cli.command {
        Command::Create {
            resources,
            base,
            read_dir,
            write_dir,
            name,
        } => commands::create(&settings, &resources, &base, &read_dir, &write_dir, &name).await?,
        Command::Run { resources, name } => commands::run(&settings, &resources, &name).await?,
        Command::CreateBaseImage { name } => commands::create_base_image(&settings, &name).await?,
        Command::Destroy { keep_disk, name } => {
            commands::destroy(&settings, &name, keep_disk).await?
        }
        Command::Status { json, name } => commands::status(&settings, &name, json).await?,
    }

    Ok(())
}
