use std::fmt;
use std::sync::Arc;

use crate::{
    command::{Command, CommandKind},
    handler::Handler,
    session::ConversationState,
};

/// Which session states a route applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePattern {
    Any,
    Is(ConversationState),
}

impl StatePattern {
    pub fn matches(&self, state: ConversationState) -> bool {
        match self {
            StatePattern::Any => true,
            StatePattern::Is(expected) => *expected == state,
        }
    }
}

/// Which inbound messages a route applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPattern {
    Is(CommandKind),
    /// Any slash command, known or not
    AnyCommand,
    /// Free text
    Text,
    Any,
}

impl CommandPattern {
    pub fn matches(&self, command: &Command) -> bool {
        match self {
            CommandPattern::Is(kind) => command.kind() == *kind,
            CommandPattern::AnyCommand => command.is_slash_command(),
            CommandPattern::Text => !command.is_slash_command(),
            CommandPattern::Any => true,
        }
    }
}

/// One entry of the dispatch table
#[derive(Clone)]
pub struct Route {
    pub state: StatePattern,
    pub command: CommandPattern,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("state", &self.state)
            .field("command", &self.command)
            .field("handler", &self.handler.id())
            .finish()
    }
}

/// Ordered `(state, command) -> handler` routes. The first matching route wins.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    pub id: String,
    routes: Vec<Route>,
}

impl DispatchTable {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            routes: Vec::new(),
        }
    }

    pub fn add_route(
        &mut self,
        state: StatePattern,
        command: CommandPattern,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        self.routes.push(Route {
            state,
            command,
            handler,
        });
        self
    }

    /// Find the handler for a message arriving in `state`
    pub fn resolve(&self, state: ConversationState, command: &Command) -> Option<Arc<dyn Handler>> {
        self.routes
            .iter()
            .find(|route| route.state.matches(state) && route.command.matches(command))
            .map(|route| route.handler.clone())
    }
}

/// Builder for creating dispatch tables
pub struct DispatchTableBuilder {
    table: DispatchTable,
}

impl DispatchTableBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            table: DispatchTable::new(id),
        }
    }

    pub fn route(
        mut self,
        state: StatePattern,
        command: CommandPattern,
        handler: Arc<dyn Handler>,
    ) -> Self {
        self.table.add_route(state, command, handler);
        self
    }

    pub fn build(self) -> DispatchTable {
        self.table
    }
}
