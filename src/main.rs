use anyhow::Context;
use puml_studio::compiler::PlantUmlCompiler;
use puml_studio::config::AppConfig;
use puml_studio::editor::TextBufferFactory;
use puml_studio::io::FsDiagramIo;
use puml_studio::preview::{LoadOutcome, LoaderEvent, PreviewLoader};
use puml_studio::session::{ManagerEvent, SessionConfig, SessionManager, SessionServices};
use puml_studio::timer::TokioTimerFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = AppConfig::load();
    let directory = match std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| config.diagram_directory.clone())
    {
        Some(dir) => std::path::absolute(&dir)
            .with_context(|| format!("Cannot resolve directory {:?}", dir))?,
        None => std::env::current_dir().context("Cannot determine the working directory")?,
    };

    let io = Arc::new(FsDiagramIo::new());
    let loader = PreviewLoader::spawn(io.clone());
    let services = SessionServices {
        compiler: Arc::new(
            PlantUmlCompiler::new(&config.plantuml_command).with_timeout(config.compile_timeout()),
        ),
        io,
        timers: Arc::new(TokioTimerFactory),
        editors: Arc::new(TextBufferFactory),
    };
    let manager = SessionManager::spawn(services, SessionConfig::from(&config), loader.clone());

    let mut loader_events = loader.subscribe();
    let mut manager_events = manager.subscribe();

    if !loader.set_directory(directory.clone()).await? {
        anyhow::bail!("{:?} is not a directory", directory);
    }
    match loader.load().await? {
        LoadOutcome::Failed { loaded, error } => {
            tracing::warn!("Listed {} diagram(s) before failing: {}", loaded, error)
        }
        outcome => tracing::info!("{:?}", outcome.summary()),
    }

    for preview in loader.previews().await? {
        println!("{}", preview.path().display());
        for line in preview.excerpt().lines() {
            println!("    {}", line);
        }
    }

    for result in loader.open_diagram_files(config.open_files.clone()).await {
        match result {
            Ok(preview) => {
                manager.open_for_edit(preview).await?;
            }
            Err(e) => tracing::warn!("Could not reopen diagram: {}", e),
        }
    }

    tracing::info!("Watching {:?}, press Ctrl-C to quit", directory);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = loader_events.recv() => match event {
                Ok(LoaderEvent::PreviewAdded(preview)) => {
                    println!("+ {}", preview.path().display())
                }
                Ok(LoaderEvent::PreviewRemoved(preview)) => {
                    println!("- {}", preview.path().display())
                }
                Ok(LoaderEvent::DiagramDeleted(diagram)) => {
                    tracing::info!("{:?} was deleted", diagram.path())
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            event = manager_events.recv() => match event {
                Ok(ManagerEvent::DiagramOpened(diagram)) => {
                    tracing::info!("Editing {:?}", diagram.path())
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.close_all().await?;
    while let Ok(event) = manager_events.try_recv() {
        if let ManagerEvent::Closing { open_files } = event {
            config.open_files = open_files;
        }
    }

    config.diagram_directory = Some(directory);
    config.save().context("Failed to save configuration")?;
    Ok(())
}
