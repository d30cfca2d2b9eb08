use paramserve::app::{AppState, MANAGER_CONNECTION_ID};
use paramserve::frame::{
    Frame, CIPHER_METADATA_REQUEST, CIPHER_METADATA_RESPONSE, CIPHER_MODIFY,
    CIPHER_PARAMETERS_REQUEST, CIPHER_PARAMETERS_RESPONSE, CIPHER_PAUSE, CIPHER_RUN,
};
use paramserve::param::Constraints;
use paramserve::value::Value;
use paramserve::{Application, Handler};

#[derive(Default)]
struct TrackingHandler {
    run_count: u32,
    pause_count: u32,
}

impl Handler for TrackingHandler {
    fn on_run(&mut self) {
        self.run_count += 1;
    }
    fn on_pause(&mut self) {
        self.pause_count += 1;
    }
}

#[test]
fn application_will_not_run_with_invalid_parameters() {
    let mut app = Application::new("svc", TrackingHandler::default());
    app.registry.register_parameter(
        100,
        "limit",
        Value::I32(5),
        Constraints::range(Value::I32(0), Value::I32(10)),
    );
    let _ = app.registry.merge(100, Value::I32(999));

    app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
    assert_eq!(app.state(), AppState::Paused);
    assert_eq!(app.handler().run_count, 0);
}

#[test]
fn only_the_manager_connection_can_drive_lifecycle() {
    let mut app = Application::new("svc", TrackingHandler::default());
    app.dispatch(7, &Frame::new(CIPHER_RUN));
    assert_eq!(app.state(), AppState::Paused);

    app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
    assert_eq!(app.state(), AppState::Running);
    assert_eq!(app.handler().run_count, 1);

    app.dispatch(7, &Frame::new(CIPHER_PAUSE));
    assert_eq!(app.state(), AppState::Running);
}

#[test]
fn modify_then_run_reflects_the_merged_value() {
    let mut app = Application::new("svc", TrackingHandler::default());
    app.registry.register_parameter(
        200,
        "setting",
        Value::I32(0),
        Constraints::range(Value::I32(0), Value::I32(100)),
    );

    let mut modify = Frame::new(CIPHER_MODIFY);
    modify.set(200, Value::I32(42));
    app.dispatch(MANAGER_CONNECTION_ID, &modify);
    assert_eq!(app.registry.get(200).unwrap().value, Value::I32(42));

    app.dispatch(MANAGER_CONNECTION_ID, &Frame::new(CIPHER_RUN));
    assert_eq!(app.state(), AppState::Running);
}

#[test]
fn metadata_and_parameters_requests_get_immediate_replies() {
    let mut app = Application::new("svc", TrackingHandler::default());
    let metadata_reply = app
        .dispatch(3, &Frame::new(CIPHER_METADATA_REQUEST))
        .unwrap();
    assert_eq!(metadata_reply.cipher, CIPHER_METADATA_RESPONSE);

    let params_reply = app
        .dispatch(3, &Frame::new(CIPHER_PARAMETERS_REQUEST))
        .unwrap();
    assert_eq!(params_reply.cipher, CIPHER_PARAMETERS_RESPONSE);
    assert!(params_reply.len() > 0);
}
