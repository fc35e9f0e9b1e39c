//! Realtime gateway: one session per authenticated socket.
//!
//! Join, leave and send are handled inline in the read loop so a client's
//! sends persist and acknowledge in the order it issued them. Read and
//! typing updates are spawned and may interleave.

use crate::{
    conversations,
    db::Store,
    error::ChatError,
    fanout::Fanout,
    hub::{conversation_room, user_room, ConnId, Outbox},
    messages, reads,
    typing::TypingTracker,
};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chat_protocol::{
    ClientEvent, ConversationId, ConversationRef, ErrorCode, ErrorNotice, FrameError, ReadReceipt,
    ReadUpdate, Ready, SendAck, SendMessage, ServerEvent, TypingNotice, TypingUpdate, UserId,
};
use futures::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

const OUTBOX_CAPACITY: usize = 256;

/// Encode a server event as a text frame.
fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server event");
            None
        }
    }
}

/// A live connection as seen by the event handlers.
#[derive(Clone)]
pub struct Session {
    pub conn: ConnId,
    pub user: UserId,
    outbox: Outbox,
}

impl Session {
    /// Queue a frame for this connection only. Waits for room in the
    /// outbox; fails only once the connection is gone.
    pub async fn reply(&self, event: &ServerEvent) {
        let Some(frame) = encode(event) else {
            return;
        };
        if self.outbox.send(frame).await.is_err() {
            tracing::debug!(conn = self.conn, "reply to closed connection");
        }
    }

    async fn error(&self, event: &str, conversation_id: Option<ConversationId>, err: &ChatError) {
        self.reply(&ServerEvent::Error(ErrorNotice {
            event: event.to_string(),
            conversation_id,
            code: err.code(),
            message: err.public_message(),
        }))
        .await;
    }
}

pub struct Gateway {
    store: Store,
    fanout: Arc<Fanout>,
    typing: TypingTracker,
}

impl Gateway {
    pub fn new(store: Store, fanout: Arc<Fanout>, typing_debounce: Duration) -> Self {
        Self {
            store,
            fanout,
            typing: TypingTracker::new(typing_debounce),
        }
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    /// Register an authenticated connection and subscribe it to its own
    /// user room. Frames for the socket arrive on the returned receiver.
    pub fn connect(&self, user: UserId) -> (Session, mpsc::Receiver<Arc<str>>) {
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let hub = self.fanout.hub();
        let conn = hub.next_conn_id();
        hub.join(&user_room(&user), conn, outbox.clone());
        (Session { conn, user, outbox }, rx)
    }

    pub fn disconnect(&self, session: &Session) {
        self.fanout.hub().leave_all(session.conn);
    }

    async fn broadcast(&self, room: &str, except: Option<ConnId>, event: &ServerEvent) {
        if let Some(frame) = encode(event) {
            self.fanout.broadcast(room, except, frame).await;
        }
    }

    /// Decode and dispatch one text frame from the client.
    pub async fn handle_frame(self: &Arc<Self>, session: &Session, text: &str) {
        match ClientEvent::decode(text) {
            Ok(event) => self.dispatch(session, event).await,
            Err(err) => self.reject_frame(session, err).await,
        }
    }

    pub async fn dispatch(self: &Arc<Self>, session: &Session, event: ClientEvent) {
        tracing::trace!(conn = session.conn, event = event.name(), "client event");
        match event {
            ClientEvent::ConvJoin(ConversationRef { conversation_id }) => {
                self.join(session, conversation_id).await
            }
            ClientEvent::ConvLeave(ConversationRef { conversation_id }) => {
                self.fanout
                    .hub()
                    .leave(&conversation_room(&conversation_id), session.conn);
            }
            ClientEvent::MsgSend(send) => self.send(session, send).await,
            ClientEvent::ReadUpdate(update) => {
                let gateway = self.clone();
                let session = session.clone();
                tokio::spawn(async move { gateway.read_update(&session, update).await });
            }
            ClientEvent::Typing(update) => {
                let gateway = self.clone();
                let session = session.clone();
                tokio::spawn(async move { gateway.typing(&session, update).await });
            }
        }
    }

    async fn reject_frame(&self, session: &Session, err: FrameError) {
        tracing::debug!(conn = session.conn, error = %err, "rejected frame");
        match (err.event.as_deref(), err.client_id) {
            (Some("READ_UPDATE" | "TYPING"), _) => {}
            (Some("MSG_SEND"), Some(client_id)) => {
                let ack = SendAck::failure(client_id, ErrorCode::InvalidArgument);
                session.reply(&ServerEvent::MsgAck(ack)).await;
            }
            (event, _) => {
                let event = event.unwrap_or("UNKNOWN").to_string();
                session
                    .error(&event, None, &ChatError::InvalidArgument(err.reason))
                    .await;
            }
        }
    }

    pub async fn join(&self, session: &Session, conversation_id: ConversationId) {
        let user = session.user.clone();
        let gate = self
            .store
            .run(move |conn| conversations::authorize(conn, &user, &conversation_id).map(|_| ()))
            .await;
        match gate {
            Ok(()) => {
                self.fanout.hub().join(
                    &conversation_room(&conversation_id),
                    session.conn,
                    session.outbox.clone(),
                );
                session
                    .reply(&ServerEvent::ConvJoined(ConversationRef { conversation_id }))
                    .await;
            }
            Err(e) => {
                tracing::debug!(conn = session.conn, %conversation_id, error = %e, "join refused");
                session.error("CONV_JOIN", Some(conversation_id), &e).await;
            }
        }
    }

    /// Persist, broadcast `MSG_NEW` to the room, then acknowledge to the
    /// sending connection. Failures only produce a failed ack.
    pub async fn send(&self, session: &Session, send: SendMessage) {
        let SendMessage {
            conversation_id,
            client_id,
            body,
        } = send;
        let sender = session.user.clone();
        let appended = self
            .store
            .run(move |conn| messages::append_message(conn, &sender, &conversation_id, body))
            .await;
        match appended {
            Ok(message) => {
                let ack = SendAck::success(client_id, &message);
                self.broadcast(
                    &conversation_room(&conversation_id),
                    None,
                    &ServerEvent::MsgNew(message),
                )
                .await;
                session.reply(&ServerEvent::MsgAck(ack)).await;
            }
            Err(e) => {
                if e.code() == ErrorCode::Internal {
                    tracing::error!(conn = session.conn, error = %e, "send failed");
                } else {
                    tracing::debug!(conn = session.conn, error = %e, "send refused");
                }
                let ack = SendAck::failure(client_id, e.code());
                session.reply(&ServerEvent::MsgAck(ack)).await;
            }
        }
    }

    pub async fn read_update(&self, session: &Session, update: ReadUpdate) {
        let user = session.user.clone();
        let ReadUpdate {
            conversation_id,
            last_read_message_id,
        } = update;
        let stored = self
            .store
            .run(move |conn| {
                reads::update_read(conn, &user, &conversation_id, &last_read_message_id)
            })
            .await;
        match stored {
            Ok(state) => {
                let receipt = ServerEvent::ReadUpdated(ReadReceipt {
                    conversation_id: state.conversation_id,
                    user_id: state.user_id,
                    last_read_message_id: state.last_read_message_id,
                });
                self.broadcast(
                    &conversation_room(&conversation_id),
                    Some(session.conn),
                    &receipt,
                )
                .await;
            }
            Err(e) => tracing::debug!(conn = session.conn, error = %e, "read update dropped"),
        }
    }

    pub async fn typing(&self, session: &Session, update: TypingUpdate) {
        let user = session.user.clone();
        let TypingUpdate {
            conversation_id,
            is_typing,
        } = update;
        let gate = self
            .store
            .run(move |conn| conversations::authorize(conn, &user, &conversation_id).map(|_| ()))
            .await;
        if let Err(e) = gate {
            tracing::debug!(conn = session.conn, error = %e, "typing dropped");
            return;
        }
        if !self.typing.typing(&session.user, &conversation_id, is_typing) {
            return;
        }
        let notice = ServerEvent::Typing(TypingNotice {
            conversation_id,
            user_id: session.user.clone(),
            is_typing,
        });
        self.broadcast(
            &conversation_room(&conversation_id),
            Some(session.conn),
            &notice,
        )
        .await;
    }

    /// Drive an upgraded socket until either side closes.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, user: UserId) {
        let (session, mut outbox) = self.connect(user);
        tracing::info!(conn = session.conn, user = %session.user, "connection opened");
        let (mut sink, mut stream) = socket.split();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbox.recv().await {
                if sink.send(WsMessage::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
        });

        session
            .reply(&ServerEvent::Ready(Ready {
                user_id: session.user.clone(),
            }))
            .await;

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => self.handle_frame(&session, &text).await,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(conn = session.conn, error = %e, "socket read failed");
                    break;
                }
            }
        }

        self.disconnect(&session);
        writer.abort();
        tracing::info!(conn = session.conn, user = %session.user, "connection closed");
    }
}
