use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accounting::{estimate_prompt_tokens, FinishReason, StreamAccumulator, UsageRecord};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::observability::{log_completion, log_stream_failure};
use crate::transport::{wire_messages, CompletionClient, FileUrls};
use crate::tree::types::{ChatId, ContentPart, MessageId, MessageNode, Role, UserId};
use crate::tree::MessageTree;

/// Events pushed to the transcript consumer while a response streams.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Text appended to the in-progress assistant message.
    Delta { text: String },
    /// The stream failed; `partial_message_id` is set when the text received
    /// so far was committed.
    Error {
        status: u16,
        message: String,
        partial_message_id: Option<MessageId>,
    },
    /// The assistant message was committed as the new active leaf.
    Done {
        message_id: MessageId,
        usage: UsageRecord,
    },
}

/// Bounded event channel sized from the chat settings.
#[must_use]
pub fn event_channel(config: &ChatConfig) -> (mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
    mpsc::channel(config.stream_channel_capacity)
}

/// Drives one request/response cycle against the message tree.
///
/// Holds no per-stream state; concurrent calls on different chats are fully
/// independent.
#[derive(Clone)]
pub struct ChatSession {
    tree: Arc<MessageTree>,
    client: Arc<CompletionClient>,
    files: Arc<dyn FileUrls>,
}

impl ChatSession {
    #[must_use]
    pub fn new(
        tree: Arc<MessageTree>,
        client: Arc<CompletionClient>,
        files: Arc<dyn FileUrls>,
    ) -> Self {
        Self {
            tree,
            client,
            files,
        }
    }

    #[must_use]
    pub fn tree(&self) -> &Arc<MessageTree> {
        &self.tree
    }

    /// Append a user message under the active leaf, then stream the reply.
    ///
    /// Returns the user node and the committed assistant node. The user node
    /// stays in the tree when the response fails.
    ///
    /// # Errors
    ///
    /// Any tree error from the append, or any error from
    /// [`ChatSession::respond`].
    pub async fn send(
        &self,
        caller: UserId,
        chat_id: ChatId,
        content: Vec<ContentPart>,
        cancel: CancellationToken,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<(MessageNode, MessageNode), ChatError> {
        let (chat, _) = self.tree.snapshot(caller, chat_id)?;
        let user = self
            .tree
            .append(caller, chat_id, chat.leaf_message_id, Role::User, content)?;
        let reply = self.respond(caller, chat_id, cancel, sink).await?;
        Ok((user, reply))
    }

    /// Stream an assistant reply to the active path and commit it as the new
    /// leaf.
    ///
    /// Each delta is applied to the in-progress text before it is forwarded
    /// to `sink`; a full sink suspends the stream. When the stream fails
    /// after text was applied, that text is committed with an unreliable
    /// usage record before the error is returned. A rejected request commits
    /// nothing. Every stream that starts ends with exactly one
    /// [`StreamEvent::Done`] or [`StreamEvent::Error`].
    ///
    /// A receiver that goes away stops this response only; `cancel` itself
    /// is never cancelled here.
    ///
    /// # Errors
    ///
    /// Tree errors for the initial read or the final commit, and any stream
    /// failure ([`ChatError::Upstream`], [`ChatError::Protocol`],
    /// [`ChatError::UpstreamTimeout`], [`ChatError::Cancelled`],
    /// [`ChatError::Transport`]).
    pub async fn respond(
        &self,
        caller: UserId,
        chat_id: ChatId,
        cancel: CancellationToken,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<MessageNode, ChatError> {
        let cancel = cancel.child_token();
        let started = Instant::now();
        let path = self.tree.active_path(caller, chat_id)?;
        let parent_id = path.last().map(|node| node.id);
        let messages = wire_messages(&path, self.files.as_ref())?;
        let input_estimate = estimate_prompt_tokens(&path, self.tree.token_counter());

        let mut deltas = match self.client.open_stream(&messages, cancel.clone()).await {
            Ok(deltas) => deltas,
            Err(err) => {
                log_stream_failure(self.client.model(), &err, 0);
                emit(sink, &cancel, error_event(&err, None)).await;
                return Err(err);
            }
        };

        let mut acc = StreamAccumulator::new(started, Instant::now());
        let failure = loop {
            match deltas.next().await {
                Some(Ok(delta)) => {
                    acc.push(&delta);
                    if delta.text.is_empty() {
                        continue;
                    }
                    let event = StreamEvent::Delta { text: delta.text };
                    if !emit(sink, &cancel, event).await {
                        cancel.cancel();
                        break Some(ChatError::Cancelled);
                    }
                }
                Some(Err(err)) => break Some(err),
                None => break None,
            }
        };
        // closes the upstream connection before any commit work
        drop(deltas);

        if let Some(err) = failure {
            return Err(self
                .commit_partial(caller, chat_id, parent_id, &acc, input_estimate, err, &cancel, sink)
                .await);
        }

        let usage = match acc.finish() {
            Ok(usage) => usage,
            Err(ChatError::IncompleteUsage) => {
                warn!(
                    chat_id = %chat_id,
                    deltas = acc.delta_count(),
                    "stream ended without usage; storing an estimate"
                );
                acc.finish_incomplete(
                    acc.finish_reason(),
                    self.tree.token_counter(),
                    input_estimate,
                )
            }
            Err(err) => return Err(self.report_unsaved(&acc, err, &cancel, sink).await),
        };

        let node = match self.tree.append_response(
            caller,
            chat_id,
            parent_id,
            vec![ContentPart::text(acc.text())],
            usage.clone(),
        ) {
            Ok(node) => node,
            Err(err) => return Err(self.report_unsaved(&acc, err, &cancel, sink).await),
        };
        log_completion(self.client.model(), &usage, started.elapsed());
        emit(
            sink,
            &cancel,
            StreamEvent::Done {
                message_id: node.id,
                usage,
            },
        )
        .await;
        Ok(node)
    }

    /// The stream completed but its reply could not be stored, for example
    /// because the parent was deleted meanwhile. Nothing is committed.
    async fn report_unsaved(
        &self,
        acc: &StreamAccumulator,
        err: ChatError,
        cancel: &CancellationToken,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> ChatError {
        log_stream_failure(self.client.model(), &err, acc.text().len());
        emit(sink, cancel, error_event(&err, None)).await;
        err
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_partial(
        &self,
        caller: UserId,
        chat_id: ChatId,
        parent_id: Option<MessageId>,
        acc: &StreamAccumulator,
        input_estimate: u64,
        err: ChatError,
        cancel: &CancellationToken,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> ChatError {
        log_stream_failure(self.client.model(), &err, acc.text().len());

        let mut partial_id = None;
        if !acc.text().is_empty() {
            let usage = acc.finish_incomplete(
                FinishReason::for_stream_error(&err),
                self.tree.token_counter(),
                input_estimate,
            );
            match self.tree.append_response(
                caller,
                chat_id,
                parent_id,
                vec![ContentPart::text(acc.text())],
                usage,
            ) {
                Ok(node) => {
                    debug!(chat_id = %chat_id, message_id = %node.id, "partial response committed");
                    partial_id = Some(node.id);
                }
                Err(commit_err) => {
                    warn!(chat_id = %chat_id, error = %commit_err, "failed to commit partial response");
                }
            }
        }

        let event = error_event(&err, partial_id);
        if cancel.is_cancelled() {
            // nobody may be draining the sink any more
            let _ = sink.try_send(event);
        } else {
            emit(sink, cancel, event).await;
        }
        err
    }
}

fn error_event(err: &ChatError, partial_message_id: Option<MessageId>) -> StreamEvent {
    StreamEvent::Error {
        status: err.http_status().as_u16(),
        message: err.to_string(),
        partial_message_id,
    }
}

/// Send one event, giving up when the receiver is gone or `cancel` fires.
async fn emit(
    sink: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    event: StreamEvent,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = sink.send(event) => sent.is_ok(),
    }
}
