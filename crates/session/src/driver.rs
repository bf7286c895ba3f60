// Async driver for one session controller.
//
// The controller is synchronous; this task owns it and serializes the three
// sources of work onto it: transport events, UI commands and timer deadlines.
// Collaborator calls (snapshot fetch/save, comment list/create) are awaited
// inline so their results are applied in order with everything else.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tandem_common::types::{DocumentContent, NewComment};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::anchors::ReplayReport;
use crate::collab::{CommentStore, SnapshotStore};
use crate::command::{EditorCommand, Selection};
use crate::controller::SessionController;
use crate::engine::awareness::CursorRange;
use crate::presence::PresenceEntry;
use crate::state::UiStatus;
use crate::transport::{ReplicationTransport, TransportEvent};

#[derive(Debug)]
pub enum UiCommand {
    Apply { selection: Selection, command: EditorCommand },
    SetContent(DocumentContent),
    SetCursor(Option<CursorRange>),
    CreateComment { start: u32, end: u32, text: String, reply: oneshot::Sender<Result<String>> },
    ReplayComments { reply: oneshot::Sender<Result<ReplayReport>> },
    GoLocalOnly,
    Retry,
    SaveSnapshot { reply: oneshot::Sender<Result<()>> },
    Content { reply: oneshot::Sender<DocumentContent> },
    Shutdown,
}

pub struct SessionHandle {
    commands: mpsc::UnboundedSender<UiCommand>,
    status: watch::Receiver<UiStatus>,
    presence: watch::Receiver<Vec<PresenceEntry>>,
    task: Option<JoinHandle<DocumentContent>>,
}

impl SessionHandle {
    pub fn status(&self) -> watch::Receiver<UiStatus> {
        self.status.clone()
    }

    pub fn presence(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.presence.clone()
    }

    pub fn send(&self, command: UiCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| anyhow!("session task has exited"))
    }

    pub fn apply(&self, selection: Selection, command: EditorCommand) -> Result<()> {
        self.send(UiCommand::Apply { selection, command })
    }

    pub fn set_content(&self, content: DocumentContent) -> Result<()> {
        self.send(UiCommand::SetContent(content))
    }

    pub async fn create_comment(&self, start: u32, end: u32, text: impl Into<String>) -> Result<String> {
        let (reply, response) = oneshot::channel();
        self.send(UiCommand::CreateComment { start, end, text: text.into(), reply })?;
        response.await.context("session task dropped the comment request")?
    }

    pub async fn replay_comments(&self) -> Result<ReplayReport> {
        let (reply, response) = oneshot::channel();
        self.send(UiCommand::ReplayComments { reply })?;
        response.await.context("session task dropped the replay request")?
    }

    pub async fn save_snapshot(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(UiCommand::SaveSnapshot { reply })?;
        response.await.context("session task dropped the save request")?
    }

    pub async fn content(&self) -> Result<DocumentContent> {
        let (reply, response) = oneshot::channel();
        self.send(UiCommand::Content { reply })?;
        response.await.context("session task dropped the content request")
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for_status(&self, predicate: impl Fn(UiStatus) -> bool) -> Result<UiStatus> {
        let mut status = self.status.clone();
        let current = status.wait_for(|value| predicate(*value)).await.context("session task has exited")?;
        Ok(*current)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(UiCommand::Shutdown);
    }

    /// Unmount and return the final document content.
    pub async fn wait(mut self) -> Result<DocumentContent> {
        self.shutdown();
        let task = self.task.take().ok_or_else(|| anyhow!("session task already joined"))?;
        task.await.context("session task panicked")
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Mount `controller` on a new task. `events` must be the receiving end of
/// the channel the controller's transport reports to.
pub fn spawn_session<T, C>(
    controller: SessionController<T>,
    collaborator: Option<C>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
) -> SessionHandle
where
    T: ReplicationTransport + Send + Sync + 'static,
    C: SnapshotStore + CommentStore + Send + Sync + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(UiStatus::Disconnected);
    let (presence_tx, presence_rx) = watch::channel(Vec::new());

    let driver = Driver { controller, collaborator, status_tx, presence_tx, comments_replayed: false };
    let task = tokio::spawn(driver.run(events, commands_rx));

    SessionHandle { commands: commands_tx, status: status_rx, presence: presence_rx, task: Some(task) }
}

struct Driver<T: ReplicationTransport, C> {
    controller: SessionController<T>,
    collaborator: Option<C>,
    status_tx: watch::Sender<UiStatus>,
    presence_tx: watch::Sender<Vec<PresenceEntry>>,
    comments_replayed: bool,
}

impl<T, C> Driver<T, C>
where
    T: ReplicationTransport + Send + Sync + 'static,
    C: SnapshotStore + CommentStore + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<UiCommand>,
    ) -> DocumentContent {
        let document_id = self.controller.document_id().to_string();
        if let Err(error) = self.controller.mount(Instant::now()) {
            warn!(%document_id, ?error, "failed to mount session");
        }
        self.publish();
        self.seed_from_snapshot().await;

        loop {
            self.replay_comments_once().await;
            let deadline = self.controller.next_deadline();
            tokio::select! {
                Some(event) = events.recv() => {
                    self.controller.handle_transport(event, Instant::now());
                }
                command = commands.recv() => {
                    match command {
                        None | Some(UiCommand::Shutdown) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                () = sleep_until_deadline(deadline) => {
                    self.controller.tick(Instant::now());
                }
            }
            self.publish();
        }

        let content = self.controller.content();
        self.controller.unmount(Instant::now());
        self.publish();
        info!(%document_id, "session unmounted");
        content
    }

    async fn seed_from_snapshot(&mut self) {
        let Some(collaborator) = &self.collaborator else {
            return;
        };
        let document_id = self.controller.document_id().to_string();
        match collaborator.fetch(&document_id).await {
            Ok(Some(snapshot)) => {
                match self.controller.set_content(snapshot.content, Instant::now()) {
                    Ok(decision) => debug!(%document_id, ?decision, "snapshot seed requested"),
                    Err(error) => warn!(%document_id, ?error, "failed to seed from snapshot"),
                }
            }
            Ok(None) => debug!(%document_id, "no persisted snapshot"),
            Err(error) => warn!(%document_id, ?error, "failed to fetch persisted snapshot"),
        }
    }

    /// Replay persisted comments the first time the document has settled
    /// content: after the first sync, or on falling back to local-only.
    async fn replay_comments_once(&mut self) {
        if self.comments_replayed || self.collaborator.is_none() {
            return;
        }
        if !matches!(self.controller.status(), UiStatus::Synced | UiStatus::LocalOnly) {
            return;
        }
        self.comments_replayed = true;
        if let Err(error) = self.replay_comments().await {
            warn!(document_id = %self.controller.document_id(), ?error, "comment replay failed");
        }
    }

    async fn replay_comments(&mut self) -> Result<ReplayReport> {
        let collaborator = self.collaborator.as_ref().ok_or_else(|| anyhow!("no comment collaborator configured"))?;
        let records = collaborator.list(self.controller.document_id()).await?;
        let report = self.controller.replay_comments(records)?;
        info!(
            document_id = %self.controller.document_id(),
            marked = report.marked.len(),
            skipped = report.already_applied.len(),
            unanchored = report.unanchored.len(),
            rejected = report.rejected.len(),
            "replayed comments"
        );
        Ok(report)
    }

    async fn create_comment(&mut self, start: u32, end: u32, text: String) -> Result<String> {
        self.controller.validate_comment_range(start, end)?;
        let collaborator = self.collaborator.as_ref().ok_or_else(|| anyhow!("no comment collaborator configured"))?;
        let created = collaborator.create(self.controller.document_id(), &NewComment { start, end, text }).await?;
        self.controller.attach_comment(&created.id, start, end, Utc::now())?;
        Ok(created.id)
    }

    async fn save_snapshot(&self) -> Result<()> {
        let collaborator = self.collaborator.as_ref().ok_or_else(|| anyhow!("no persistence collaborator configured"))?;
        collaborator.save(self.controller.document_id(), &self.controller.content()).await?;
        Ok(())
    }

    async fn handle_command(&mut self, command: UiCommand) {
        let now = Instant::now();
        match command {
            UiCommand::Apply { selection, command } => {
                if let Err(error) = self.controller.apply(selection, &command) {
                    warn!(?error, "editor command failed");
                }
            }
            UiCommand::SetContent(content) => {
                if let Err(error) = self.controller.set_content(content, now) {
                    warn!(?error, "set content failed");
                }
            }
            UiCommand::SetCursor(cursor) => {
                if let Err(error) = self.controller.set_cursor(cursor) {
                    warn!(?error, "cursor update failed");
                }
            }
            UiCommand::CreateComment { start, end, text, reply } => {
                let _ = reply.send(self.create_comment(start, end, text).await);
            }
            UiCommand::ReplayComments { reply } => {
                let _ = reply.send(self.replay_comments().await);
            }
            UiCommand::GoLocalOnly => self.controller.go_local_only(now),
            UiCommand::Retry => self.controller.retry(now),
            UiCommand::SaveSnapshot { reply } => {
                let _ = reply.send(self.save_snapshot().await);
            }
            UiCommand::Content { reply } => {
                let _ = reply.send(self.controller.content());
            }
            UiCommand::Shutdown => {}
        }
    }

    fn publish(&self) {
        let status = self.controller.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        let presence = self.controller.presence();
        self.presence_tx.send_if_modified(|current| {
            if *current == presence {
                return false;
            }
            *current = presence;
            true
        });
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
