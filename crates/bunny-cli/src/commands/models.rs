//! Model listing.

use super::{format_bytes, Bunny};

/// List installed and available models.
pub(crate) async fn run(coordinator: &Bunny) -> miette::Result<()> {
    let models = coordinator
        .refresh_models()
        .await
        .map_err(|e| miette::miette!("Failed to list models: {}", e))?;

    if models.is_empty() {
        println!("The registry has no models.");
        return Ok(());
    }

    let (installed, available): (Vec<_>, Vec<_>) = models.iter().partition(|m| m.installed);

    if installed.is_empty() {
        println!("No models installed.");
    } else {
        println!("Installed models:");
        for model in installed {
            match model.size {
                Some(size) => println!("  - {} ({})", model.name, format_bytes(size)),
                None => println!("  - {}", model.name),
            }
        }
    }

    if !available.is_empty() {
        println!();
        println!("Available to download:");
        for model in available {
            match &model.repo_id {
                Some(repo) => println!("  - {} [{}]", model.name, repo),
                None => println!("  - {}", model.name),
            }
        }
        println!();
        println!("To download a model, run:");
        println!("  bunny pull <model>");
    }

    Ok(())
}
