use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{domain::UnitId, protocol::Document};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://blockworks.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUnit {
        name: String,
        #[arg(long)]
        template: Option<PathBuf>,
    },
    SetTemplate {
        unit_id: i64,
        name: String,
        template: PathBuf,
    },
    ListSaves {
        unit_id: i64,
    },
}

fn read_template(path: &PathBuf) -> Result<Document> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read template {}", path.display()))?;
    Ok(Document::new(text))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUnit { name, template } => {
            let template = template.as_ref().map(read_template).transpose()?;
            let unit_id = storage.create_unit(&name, template.as_ref()).await?;
            println!("created unit_id={}", unit_id.0);
        }
        Command::SetTemplate {
            unit_id,
            name,
            template,
        } => {
            let template = read_template(&template)?;
            storage
                .upsert_unit(UnitId(unit_id), &name, Some(&template))
                .await?;
            println!("updated unit_id={unit_id} template_bytes={}", template.byte_len());
        }
        Command::ListSaves { unit_id } => {
            let saves = storage.save_set(UnitId(unit_id)).await?;
            if saves.is_empty() {
                println!("no saves for unit_id={unit_id}");
            }
            for (label, save) in saves
                .current
                .iter()
                .map(|save| ("current", save))
                .chain(saves.past.iter().map(|save| ("past", save)))
            {
                println!(
                    "{label} save_id={} updated_at={} bytes={}",
                    save.id.0,
                    save.updated_at.to_rfc3339(),
                    save.workspace.byte_len()
                );
            }
        }
    }

    Ok(())
}
