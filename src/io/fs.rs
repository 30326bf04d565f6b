use super::{DiagramIo, FsEvent, IoError, ReadProgress};
use crate::constants::{BACKUP_EXTENSION, EVENT_CHANNEL_CAPACITY};
use crate::diagram::{is_diagram_file, Diagram, Image, ImageFormat};
use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Diagram I/O on the local filesystem, with a `notify` watcher for the
/// monitored directory.
pub struct FsDiagramIo {
    events: broadcast::Sender<FsEvent>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Default for FsDiagramIo {
    fn default() -> Self {
        Self::new()
    }
}

impl FsDiagramIo {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            watcher: Mutex::new(None),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// `a.puml` -> `a.puml.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(Into::into).unwrap_or_default();
    name.push(".");
    name.push(BACKUP_EXTENSION);
    path.with_file_name(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(Into::into).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), IoError> {
    let temp = temp_path(path);
    let mut file = tokio::fs::File::create(&temp)
        .await
        .map_err(|e| IoError::from_io(&temp, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| IoError::from_io(&temp, e))?;
    file.sync_all()
        .await
        .map_err(|e| IoError::from_io(&temp, e))?;
    drop(file);
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| IoError::from_io(path, e))
}

/// Maps a raw watcher event to diagram add/delete events.
pub fn translate_event(event: &notify::Event) -> Vec<FsEvent> {
    let diagrams = event.paths.iter().filter(|p| is_diagram_file(p));
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            diagrams.cloned().map(FsEvent::Added).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            diagrams.cloned().map(FsEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first().filter(|p| is_diagram_file(p)) {
                out.push(FsEvent::Deleted(from.clone()));
            }
            if let Some(to) = event.paths.get(1).filter(|p| is_diagram_file(p)) {
                out.push(FsEvent::Added(to.clone()));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(_)) => diagrams
            .map(|p| {
                if p.exists() {
                    FsEvent::Added(p.clone())
                } else {
                    FsEvent::Deleted(p.clone())
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl DiagramIo for FsDiagramIo {
    async fn read(&self, file: &Path) -> Result<Option<Diagram>, IoError> {
        let content = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| IoError::from_io(file, e))?;
        Ok(Diagram::parse(file, content))
    }

    async fn save(&self, diagram: &Diagram, make_backup: bool) -> Result<(), IoError> {
        let path = diagram.path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IoError::from_io(parent, e))?;
        }
        if make_backup && tokio::fs::try_exists(path).await.unwrap_or(false) {
            let backup = backup_path(path);
            tokio::fs::copy(path, &backup)
                .await
                .map_err(|e| IoError::from_io(&backup, e))?;
            tracing::debug!("Backed up {:?} to {:?}", path, backup);
        }
        write_atomic(path, diagram.content.as_bytes()).await?;
        tracing::info!("Saved {:?}", path);
        Ok(())
    }

    async fn delete(&self, diagram: &Diagram) -> Result<(), IoError> {
        tokio::fs::remove_file(diagram.path())
            .await
            .map_err(|e| IoError::from_io(diagram.path(), e))?;
        tracing::info!("Deleted {:?}", diagram.path());
        Ok(())
    }

    async fn read_image(&self, file: &Path, format: ImageFormat) -> Result<Image, IoError> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| IoError::from_io(file, e))?;
        Ok(Image::new(format, bytes))
    }

    async fn read_diagrams(
        &self,
        directory: &Path,
        progress: mpsc::UnboundedSender<ReadProgress>,
        cancel: CancellationToken,
    ) -> Result<Vec<Diagram>, IoError> {
        let mut entries = tokio::fs::read_dir(directory)
            .await
            .map_err(|e| IoError::from_io(directory, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IoError::from_io(directory, e))?
        {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && is_diagram_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let total = files.len();
        let mut diagrams = Vec::with_capacity(total);
        for (i, path) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IoError::Cancelled);
            }
            let diagram = match self.read(path).await {
                Ok(diagram) => diagram,
                // Removed between listing and reading.
                Err(IoError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            // A dropped receiver only means nobody watches progress.
            let _ = progress.send(ReadProgress {
                done: i + 1,
                total,
                diagram: diagram.clone(),
            });
            diagrams.extend(diagram);
        }
        Ok(diagrams)
    }

    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn start_monitoring(&self, directory: &Path) -> Result<(), IoError> {
        let events = self.events.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for fs_event in translate_event(&event) {
                        let _ = events.send(fs_event);
                    }
                }
                Err(e) => tracing::warn!("File watcher error: {}", e),
            }
        })
        .map_err(|e| IoError::Watch(e.to_string()))?;
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|e| IoError::Watch(e.to_string()))?;

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        tracing::info!("Monitoring {:?}", directory);
        Ok(())
    }

    fn stop_monitoring(&self) {
        if self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            tracing::debug!("Stopped directory monitoring");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};
    use std::fs;
    use tempfile::tempdir;

    const SEQ: &str = "\n@startuml\nAlice -> Bob\n@enduml\n";

    #[tokio::test]
    async fn test_read_parses_diagram_or_none() {
        let dir = tempdir().unwrap();
        let diagram_path = dir.path().join("a.puml");
        let notes_path = dir.path().join("notes.puml");
        fs::write(&diagram_path, SEQ).unwrap();
        fs::write(&notes_path, "not a diagram").unwrap();

        let io = FsDiagramIo::new();
        let diagram = io.read(&diagram_path).await.unwrap().unwrap();
        assert_eq!(diagram.content, SEQ);
        assert!(io.read(&notes_path).await.unwrap().is_none());
        assert!(matches!(
            io.read(&dir.path().join("missing.puml")).await,
            Err(IoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_backs_up_previous_content_only_when_asked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.puml");
        fs::write(&path, SEQ).unwrap();
        let io = FsDiagramIo::new();

        let mut diagram = Diagram::new(&path, "\n@startuml\nBob -> Alice\n@enduml\n");
        io.save(&diagram, true).await.unwrap();
        assert_eq!(fs::read_to_string(backup_path(&path)).unwrap(), SEQ);
        assert_eq!(fs::read_to_string(&path).unwrap(), diagram.content);

        diagram.content = "\n@startuml\n@enduml\n".to_string();
        io.save(&diagram, false).await.unwrap();
        assert_eq!(fs::read_to_string(backup_path(&path)).unwrap(), SEQ);
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_save_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("new.puml");
        let io = FsDiagramIo::new();
        io.save(&Diagram::new(&path, SEQ), true).await.unwrap();
        assert!(path.exists());
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_delete_and_read_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.puml");
        let image_path = dir.path().join("a.png");
        fs::write(&path, SEQ).unwrap();
        fs::write(&image_path, [1u8, 2, 3]).unwrap();
        let io = FsDiagramIo::new();

        let image = io.read_image(&image_path, ImageFormat::Png).await.unwrap();
        assert_eq!(image.bytes(), &[1, 2, 3]);

        let diagram = io.read(&path).await.unwrap().unwrap();
        io.delete(&diagram).await.unwrap();
        assert!(!path.exists());
        assert!(matches!(io.delete(&diagram).await, Err(IoError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_read_diagrams_reports_progress_in_name_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.puml"), SEQ).unwrap();
        fs::write(dir.path().join("a.puml"), SEQ).unwrap();
        fs::write(dir.path().join("c.puml"), "no diagram here").unwrap();
        fs::write(dir.path().join("readme.md"), SEQ).unwrap();

        let io = FsDiagramIo::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let diagrams = io
            .read_diagrams(dir.path(), tx, CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = diagrams.iter().map(|d| d.file_name()).collect();
        assert_eq!(names, vec!["a.puml", "b.puml"]);

        let mut reports = Vec::new();
        while let Ok(p) = rx.try_recv() {
            reports.push((p.done, p.total, p.diagram.is_some()));
        }
        assert_eq!(reports, vec![(1, 3, true), (2, 3, true), (3, 3, false)]);
    }

    #[tokio::test]
    async fn test_read_diagrams_honours_cancellation() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.puml"), SEQ).unwrap();
        let io = FsDiagramIo::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = io.read_diagrams(dir.path(), tx, cancel).await;
        assert!(matches!(result, Err(IoError::Cancelled)));
    }

    #[test]
    fn test_translate_event_filters_and_maps_kinds() {
        let created = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/d/a.puml"))
            .add_path(PathBuf::from("/d/a.puml.tmp"));
        assert_eq!(
            translate_event(&created),
            vec![FsEvent::Added(PathBuf::from("/d/a.puml"))]
        );

        let removed = notify::Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/d/b.puml"));
        assert_eq!(
            translate_event(&removed),
            vec![FsEvent::Deleted(PathBuf::from("/d/b.puml"))]
        );

        let renamed = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/d/old.puml"))
            .add_path(PathBuf::from("/d/new.puml"));
        assert_eq!(
            translate_event(&renamed),
            vec![
                FsEvent::Deleted(PathBuf::from("/d/old.puml")),
                FsEvent::Added(PathBuf::from("/d/new.puml")),
            ]
        );

        let saved_over = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/d/a.puml.tmp"))
            .add_path(PathBuf::from("/d/a.puml"));
        assert_eq!(
            translate_event(&saved_over),
            vec![FsEvent::Added(PathBuf::from("/d/a.puml"))]
        );
    }

    #[tokio::test]
    async fn test_monitoring_can_be_started_and_stopped() {
        let dir = tempdir().unwrap();
        let io = FsDiagramIo::new();
        assert!(io.start_monitoring(&dir.path().join("missing")).is_err());
        assert!(!io.is_monitoring());

        io.start_monitoring(dir.path()).unwrap();
        assert!(io.is_monitoring());
        io.stop_monitoring();
        assert!(!io.is_monitoring());
    }

    #[test]
    fn test_backup_path_keeps_extension() {
        assert_eq!(
            backup_path(Path::new("/d/a.puml")),
            PathBuf::from("/d/a.puml.bak")
        );
    }
}
