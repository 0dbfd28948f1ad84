use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use client_core::{
    codec::Block,
    config::load_settings,
    display::format_timestamp,
    store::{HttpSaveStore, SaveStore},
    version::TEMPLATE_SENTINEL,
    workspace::{MemoryWorkspaceFactory, WorkspaceEngine},
    SessionController, UiState, VersionToken,
};
use shared::domain::{EditorRole, UnitId};

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    unit: i64,
    #[arg(long, default_value = "student_editor")]
    role: EditorRole,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists the saves recorded for the unit.
    History,
    /// Mounts the unit and prints the loaded workspace. Read-only.
    Show,
    /// Loads a save id (or `template`) and unmounts, which stores it as the
    /// new current save for a student editor.
    Restore { token: VersionToken },
    /// Mounts the unit and saves it once. Unmounting does not save again.
    Save,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let store = HttpSaveStore::new(&settings.server_url)?;
    let unit_id = UnitId(args.unit);

    if let Command::History = args.command {
        let saves = store.fetch_save_set(unit_id).await?;
        println!("{TEMPLATE_SENTINEL:>6}  original template");
        for save in saves.current.iter().chain(saves.past.iter()) {
            println!(
                "{:>6}  {}",
                save.id.0,
                format_timestamp(save.updated_at, settings.display_offset)
            );
        }
        return Ok(());
    }

    let unit = store.fetch_unit(unit_id).await?;
    let factory = Arc::new(MemoryWorkspaceFactory::new());
    let controller = SessionController::from_settings(settings, factory.clone())?;
    let mut state = controller.initialize(unit, args.role).await?;

    let unmount_save = matches!(args.command, Command::Restore { .. });
    let outcome = match args.command {
        Command::History | Command::Show => Ok(()),
        Command::Restore { token } => controller
            .select_version(token)
            .await
            .map(|restored| state = restored),
        Command::Save => controller
            .manual_save()
            .await
            .map(|saved| state = saved),
    };

    if outcome.is_ok() {
        print_state(&state);
        let canvas = factory
            .last_created()
            .ok_or_else(|| anyhow!("no workspace was created"))?;
        print_blocks(&canvas.snapshot().blocks, 0);
    }

    if unmount_save {
        controller.teardown().await;
    } else {
        controller.release().await;
    }
    controller.tasks().flush().await;
    outcome.map_err(Into::into)
}

fn print_state(state: &UiState) {
    println!(
        "unit={} role={:?} last_saved={}",
        state.unit_id.0,
        state.role,
        state.last_saved.as_deref().unwrap_or("never")
    );
    if state.undo_controls_visible {
        println!(
            "undo={} redo={}",
            state.undo.can_undo, state.undo.can_redo
        );
    }
}

fn print_blocks(blocks: &[Block], depth: usize) {
    for block in blocks {
        let fields = block
            .fields
            .iter()
            .map(|(name, value)| format!(" {name}={value}"))
            .collect::<String>();
        println!("{:indent$}{} #{}{}", "", block.kind, block.id, fields, indent = depth * 2);
        print_blocks(&block.children, depth + 1);
    }
}
