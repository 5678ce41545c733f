/// Multi-conversation inbox: one focused session at a time
///
/// Switching focus is strictly sequential: the old session is closed before
/// the new one opens, so two channels never deliver at once.
use crate::backend::Backend;
use crate::config::Config;
use crate::error::Result;
use crate::message::{ConversationScope, Credential, Participant};
use crate::realtime::Connector;
use crate::session::{ConversationSession, OpenOutcome, SessionState};
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Inbox row for a conversation seen in this registry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub peer: Participant,
    pub last_preview: Option<String>,
    pub last_date: Option<NaiveDate>,
    pub last_time: Option<NaiveTime>,
    pub message_count: usize,
}

impl ConversationSummary {
    fn of<B: Backend, C: Connector>(session: &ConversationSession<B, C>) -> Option<Self> {
        let scope = session.scope()?;
        let last = session.last_message();
        Some(Self {
            conversation_id: scope.conversation_id(),
            peer: scope.remote,
            last_preview: last.as_ref().map(|m| m.preview()),
            last_date: last.as_ref().map(|m| m.sent_at_date),
            last_time: last.as_ref().map(|m| m.sent_at_time),
            message_count: session.message_count(),
        })
    }
}

pub struct SessionRegistry<B, C> {
    backend: Arc<B>,
    connector: C,
    config: Config,
    local: Participant,
    credential: Credential,
    focused: Option<Arc<ConversationSession<B, C>>>,
    summaries: HashMap<String, ConversationSummary>,
}

impl<B: Backend, C: Connector + Clone> SessionRegistry<B, C> {
    pub fn new(
        backend: Arc<B>,
        connector: C,
        config: Config,
        local: Participant,
        credential: Credential,
    ) -> Self {
        Self {
            backend,
            connector,
            config,
            local,
            credential,
            focused: None,
            summaries: HashMap::new(),
        }
    }

    /// Focus the conversation with `remote`.
    ///
    /// Returns the live session when it is already focused and active;
    /// otherwise closes the current one and opens a fresh session. A failed
    /// open leaves nothing focused.
    pub async fn focus(
        &mut self,
        remote: Participant,
    ) -> Result<(Arc<ConversationSession<B, C>>, Option<OpenOutcome>)> {
        let scope = ConversationScope::new(self.local.clone(), remote);

        if let Some(current) = &self.focused {
            if current.scope().as_ref() == Some(&scope) && current.state() == SessionState::Active {
                debug!("{} already focused", scope.conversation_id());
                return Ok((current.clone(), None));
            }
        }

        self.blur();

        let session = Arc::new(ConversationSession::new(
            self.backend.clone(),
            self.connector.clone(),
            &self.config,
        ));
        let outcome = session.open(scope.clone(), self.credential.clone()).await?;
        info!("Focused {}", scope.conversation_id());
        self.focused = Some(session.clone());
        Ok((session, Some(outcome)))
    }

    /// Close the focused session, keeping its summary
    pub fn blur(&mut self) {
        if let Some(session) = self.focused.take() {
            if let Some(summary) = ConversationSummary::of(&session) {
                debug!("Blurring {}", summary.conversation_id);
                self.summaries.insert(summary.conversation_id.clone(), summary);
            }
            session.close();
        }
    }

    pub fn focused(&self) -> Option<Arc<ConversationSession<B, C>>> {
        self.focused.clone()
    }

    pub fn close_all(&mut self) {
        self.blur();
        info!("Registry closed ({} conversations seen)", self.summaries.len());
    }

    /// Inbox rows, most recent first. The focused conversation is live.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut rows: HashMap<String, ConversationSummary> = self.summaries.clone();
        if let Some(summary) = self.focused.as_deref().and_then(ConversationSummary::of) {
            rows.insert(summary.conversation_id.clone(), summary);
        }

        let mut rows: Vec<_> = rows.into_values().collect();
        rows.sort_by(|a, b| {
            (b.last_date, b.last_time)
                .cmp(&(a.last_date, a.last_time))
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        rows
    }
}
