//! Application lifecycle: the `Paused`/`Running` state machine and
//! dispatch of the nine reserved control ciphers to a [`Handler`].
//!
//! Grounded on `tchajed-rust-nbd/src/server.rs::handle_ops`'s shape — read
//! one discriminated request, `match` on its kind, dispatch to a small
//! number of named operations — generalized here from a flat command enum
//! to a keyed [`Frame`]. The C++ original this protocol was distilled from
//! expressed `Server`/`Application`/`Handler` as one inheritance chain; this
//! crate takes the redesign flag in the spec literally and splits it into a
//! `Handler` trait plus a generic `Application<H>` so dispatch never needs
//! a vtable on its hot path.
use std::collections::BTreeMap;

use log::{debug, info, warn};

const APPLICATION_STATE_LABELS: [(i64, &str); 2] = [(0, "Paused"), (1, "Running")];

use crate::frame::{
    Frame, CIPHER_DELETE, CIPHER_HELLO, CIPHER_METADATA_REQUEST, CIPHER_METADATA_RESPONSE,
    CIPHER_MODIFY, CIPHER_PARAMETERS_REQUEST, CIPHER_PARAMETERS_RESPONSE, CIPHER_PAUSE, CIPHER_RUN,
};
use crate::param::{Constraints, MergeError, ParamRegistry};
use crate::value::Value;

/// Parameter id of the always-registered, constant "Name" slot.
pub const PARAM_NAME: u64 = 2_000_001;
/// Parameter id of the always-registered "Application state" slot, kept in
/// sync with `AppState` by the application itself rather than by a remote
/// merge.
pub const PARAM_APPLICATION_STATE: u64 = 2_000_002;

/// The connection id reserved for the sole manager connection: only frames
/// arriving from this id may run, pause, modify or delete the application.
pub const MANAGER_CONNECTION_ID: i32 = 0;

/// The application's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Paused,
    Running,
}

impl AppState {
    fn as_code(self) -> i32 {
        match self {
            AppState::Paused => 0,
            AppState::Running => 1,
        }
    }
}

/// The hooks an application plugs in to react to the standard control
/// protocol. Every method has a default that does the minimum the spec
/// documents, so a `Handler` impl only needs to override what it cares
/// about.
pub trait Handler {
    /// Called after the application transitions to `Running`. Default: no-op.
    fn on_run(&mut self) {}

    /// Called after the application transitions to `Paused`. Default: no-op.
    fn on_pause(&mut self) {}

    /// Called after a batch of parameter merges has been applied (or
    /// rejected per-slot); by this point `Application` has already paused
    /// itself if any slot came back with an error. This hook's own
    /// default is a no-op — the registry already recorded per-slot
    /// success or error.
    fn on_modify(&mut self, _results: &[(u64, Result<(), MergeError>)]) {}

    /// Called when a manager requests deletion, after `Application` has
    /// paused (if running) and marked itself for shutdown. This hook's own
    /// default is a no-op — this crate doesn't define what "delete" tears
    /// down beyond notifying the handler, since that's entirely
    /// application-specific.
    fn on_delete(&mut self) {}

    /// Called when a connection completes its hello handshake. Default: no-op.
    fn on_hello(&mut self, _connection_id: i32) {}

    /// Called when a `MetadataResponse` frame arrives from a peer this side
    /// connected out to. Default: no-op.
    fn on_metadata(&mut self, _frame: &Frame) {}

    /// Called when a `ParametersResponse` frame arrives from a peer this
    /// side connected out to. Default: no-op.
    fn on_parameters(&mut self, _frame: &Frame) {}

    /// Called when a connection is lost, after `Application` has already
    /// paused itself (the documented default for a disconnect). This
    /// hook's own default is a no-op.
    fn on_disconnect(&mut self, _connection_id: i32) {}

    /// Called after a lost outbound connection is re-established, after
    /// `Application` has already resumed running if parameters are valid
    /// (the documented default for a reconnect). This hook's own default
    /// is a no-op.
    fn on_reconnect(&mut self, _connection_id: i32) {}

    /// Called for any frame whose cipher is not in the reserved control
    /// band. Default: no-op — a handler that never overrides this simply
    /// ignores application-defined traffic.
    fn on_frame(&mut self, _connection_id: i32, _frame: &Frame) {}
}

/// Owns the parameter registry and run state, and dispatches the nine
/// reserved-cipher control frames to a `Handler`.
pub struct Application<H: Handler> {
    pub registry: ParamRegistry,
    state: AppState,
    handler: H,
    shutdown_requested: bool,
}

impl<H: Handler> Application<H> {
    /// Build a paused application, registering the two always-present
    /// slots every application exposes regardless of what it adds itself.
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        let mut registry = ParamRegistry::new();
        registry.register_const_parameter(PARAM_NAME, "Name", Value::Str(name.into()));
        registry.register_const_parameter(
            PARAM_APPLICATION_STATE,
            "Application state",
            Value::I32(AppState::Paused.as_code()),
        );
        registry.set_string_interpretations(
            PARAM_APPLICATION_STATE,
            APPLICATION_STATE_LABELS
                .iter()
                .map(|(code, label)| (*code, label.to_string()))
                .collect(),
        );
        Application {
            registry,
            state: AppState::Paused,
            handler,
            shutdown_requested: false,
        }
    }

    /// True once a manager has requested deletion; the server polls this
    /// to tear itself down after `on_delete`'s pause-then-shutdown default.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn set_state(&mut self, state: AppState) {
        self.state = state;
        self.registry
            .force_set(PARAM_APPLICATION_STATE, Value::I32(state.as_code()));
    }

    /// Dispatch one incoming frame. Returns a reply frame when the cipher
    /// calls for an immediate response (the two `*Request` ciphers);
    /// everything else returns `None`.
    ///
    /// `run`/`pause`/`modify`/`delete` are accepted only from
    /// `MANAGER_CONNECTION_ID`; frames carrying those ciphers from any
    /// other connection are logged and otherwise ignored.
    pub fn dispatch(&mut self, connection_id: i32, frame: &Frame) -> Option<Frame> {
        match frame.cipher {
            CIPHER_HELLO => {
                debug!(target: "paramserve::app", "hello from connection {connection_id}");
                self.handler.on_hello(connection_id);
                None
            }
            CIPHER_RUN => {
                self.require_manager(connection_id, "run")?;
                if self.registry.all_parameters_valid() {
                    self.set_state(AppState::Running);
                    info!(target: "paramserve::app", "application running");
                    self.handler.on_run();
                } else {
                    warn!(
                        target: "paramserve::app",
                        "refusing to run: {} parameter(s) in error",
                        self.registry.parameter_errors().len()
                    );
                }
                None
            }
            CIPHER_PAUSE => {
                self.require_manager(connection_id, "pause")?;
                self.set_state(AppState::Paused);
                info!(target: "paramserve::app", "application paused");
                self.handler.on_pause();
                None
            }
            CIPHER_MODIFY => {
                self.require_manager(connection_id, "modify")?;
                let results: Vec<(u64, Result<(), MergeError>)> = frame
                    .iter()
                    .map(|(key, (_, value))| (*key, self.registry.merge(*key, value.clone())))
                    .collect();
                if results.iter().any(|(_, r)| r.is_err()) {
                    warn!(
                        target: "paramserve::app",
                        "pausing after modify produced {} error(s)",
                        results.iter().filter(|(_, r)| r.is_err()).count()
                    );
                    self.set_state(AppState::Paused);
                    self.handler.on_pause();
                }
                self.handler.on_modify(&results);
                None
            }
            CIPHER_DELETE => {
                self.require_manager(connection_id, "delete")?;
                if self.state == AppState::Running {
                    self.set_state(AppState::Paused);
                    self.handler.on_pause();
                }
                self.shutdown_requested = true;
                info!(target: "paramserve::app", "delete requested, application will shut down");
                self.handler.on_delete();
                None
            }
            CIPHER_METADATA_REQUEST => {
                let mut reply = Frame::new(CIPHER_METADATA_RESPONSE);
                reply.set(1, Value::Str(self.registry.metadata_json()));
                Some(reply)
            }
            CIPHER_METADATA_RESPONSE => {
                self.handler.on_metadata(frame);
                None
            }
            CIPHER_PARAMETERS_REQUEST => {
                let mut reply = Frame::new(CIPHER_PARAMETERS_RESPONSE);
                let snapshot: BTreeMap<u64, Value> = self.registry.snapshot().into_iter().collect();
                for (key, value) in snapshot {
                    reply.set(key, value);
                }
                Some(reply)
            }
            CIPHER_PARAMETERS_RESPONSE => {
                self.handler.on_parameters(frame);
                None
            }
            _ => {
                self.handler.on_frame(connection_id, frame);
                None
            }
        }
    }

    fn require_manager(&self, connection_id: i32, action: &str) -> Option<()> {
        if connection_id != MANAGER_CONNECTION_ID {
            warn!(
                target: "paramserve::app",
                "ignoring {action} from non-manager connection {connection_id}"
            );
            return None;
        }
        Some(())
    }

    /// Default: behaves like a pause. A lost connection can't keep running
    /// against a peer that isn't there to receive updates.
    pub fn on_disconnect(&mut self, connection_id: i32) {
        self.set_state(AppState::Paused);
        info!(target: "paramserve::app", "connection {connection_id} lost, pausing");
        self.handler.on_pause();
        self.handler.on_disconnect(connection_id);
    }

    /// Default: behaves like a run, gated the same way `CIPHER_RUN` is — a
    /// reconnect doesn't resume if parameters are still in error.
    pub fn on_reconnect(&mut self, connection_id: i32) {
        if self.registry.all_parameters_valid() {
            self.set_state(AppState::Running);
            info!(target: "paramserve::app", "connection {connection_id} restored, resuming");
            self.handler.on_run();
        } else {
            warn!(
                target: "paramserve::app",
                "connection {connection_id} restored but parameters are invalid, staying paused"
            );
        }
        self.handler.on_reconnect(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        ran: bool,
        paused_after_run: bool,
        deleted: bool,
        disconnected: Option<i32>,
        reconnected: Option<i32>,
    }

    impl Handler for RecordingHandler {
        fn on_run(&mut self) {
            self.ran = true;
        }
        fn on_pause(&mut self) {
            if self.ran {
                self.paused_after_run = true;
            }
        }
        fn on_delete(&mut self) {
            self.deleted = true;
        }
        fn on_disconnect(&mut self, connection_id: i32) {
            self.disconnected = Some(connection_id);
        }
        fn on_reconnect(&mut self, connection_id: i32) {
            self.reconnected = Some(connection_id);
        }
    }

    #[test]
    fn run_is_gated_by_parameter_validity() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.registry.register_parameter(
            10,
            "bounded",
            Value::F64(50.0),
            Constraints::range(Value::F64(0.0), Value::F64(10.0)),
        );
        assert!(app.registry.all_parameters_valid());
        let _ = app.registry.merge(10, Value::F64(9999.0));
        assert!(!app.registry.all_parameters_valid());

        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
        assert_eq!(app.state(), AppState::Paused);
        assert!(!app.handler().ran);
    }

    #[test]
    fn non_manager_cannot_run_or_pause() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.dispatch(7, &Frame::new(CIPHER_RUN));
        assert_eq!(app.state(), AppState::Paused);
        assert!(!app.handler().ran);
    }

    #[test]
    fn manager_can_run_and_pause_in_order() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
        assert_eq!(app.state(), AppState::Running);
        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_PAUSE));
        assert_eq!(app.state(), AppState::Paused);
        assert!(app.handler().paused_after_run);
    }

    #[test]
    fn modify_merges_each_field_independently() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.registry.register_parameter(
            11,
            "a",
            Value::I32(0),
            Constraints::range(Value::I32(0), Value::I32(100)),
        );
        app.registry.register_parameter(
            12,
            "b",
            Value::I32(0),
            Constraints::range(Value::I32(0), Value::I32(100)),
        );
        let mut frame = Frame::new(CIPHER_MODIFY);
        frame.set(11, Value::I32(5));
        frame.set(12, Value::I32(9999));
        app.dispatch(MANAGER_CONNECTION_ID, &frame);
        assert_eq!(app.registry.get(11).unwrap().value, Value::I32(5));
        assert_eq!(app.registry.get(12).unwrap().value, Value::I32(0));
        assert!(!app.registry.all_parameters_valid());
    }

    #[test]
    fn metadata_request_gets_an_immediate_response() {
        let mut app = Application::new("demo", RecordingHandler::default());
        let reply = app
            .dispatch(5, &Frame::new(CIPHER_METADATA_REQUEST))
            .expect("metadata request yields a response");
        assert_eq!(reply.cipher, CIPHER_METADATA_RESPONSE);
    }

    #[test]
    fn application_state_slot_tracks_run_state() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
        assert_eq!(
            app.registry.get(PARAM_APPLICATION_STATE).unwrap().value,
            Value::I32(AppState::Running.as_code())
        );
    }

    #[test]
    fn modify_with_any_error_pauses_the_application() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.registry.register_parameter(
            13,
            "a",
            Value::I32(0),
            Constraints::range(Value::I32(0), Value::I32(100)),
        );
        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
        assert_eq!(app.state(), AppState::Running);

        let mut frame = Frame::new(CIPHER_MODIFY);
        frame.set(13, Value::I32(9999));
        app.dispatch(MANAGER_CONNECTION_ID, &frame);
        assert_eq!(app.state(), AppState::Paused);
    }

    #[test]
    fn delete_pauses_if_running_and_requests_shutdown() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
        assert_eq!(app.state(), AppState::Running);

        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_DELETE));
        assert_eq!(app.state(), AppState::Paused);
        assert!(app.shutdown_requested());
        assert!(app.handler().deleted);
    }

    #[test]
    fn disconnect_pauses_and_reconnect_resumes_when_valid() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
        assert_eq!(app.state(), AppState::Running);

        app.on_disconnect(3);
        assert_eq!(app.state(), AppState::Paused);
        assert_eq!(app.handler().disconnected, Some(3));

        app.on_reconnect(3);
        assert_eq!(app.state(), AppState::Running);
        assert_eq!(app.handler().reconnected, Some(3));
    }

    #[test]
    fn reconnect_stays_paused_when_parameters_are_invalid() {
        let mut app = Application::new("demo", RecordingHandler::default());
        app.registry.register_parameter(
            14,
            "a",
            Value::I32(0),
            Constraints::range(Value::I32(0), Value::I32(100)),
        );
        let _ = app.registry.merge(14, Value::I32(9999));

        app.on_reconnect(4);
        assert_eq!(app.state(), AppState::Paused);
        assert_eq!(app.handler().reconnected, Some(4));
    }
}
