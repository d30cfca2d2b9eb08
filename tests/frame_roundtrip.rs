use paramserve::frame::Frame;
use paramserve::value::{Duration, Timestamp, Value};

#[test]
fn a_frame_with_every_scalar_kind_round_trips() {
    let mut frame = Frame::new(42);
    frame.set(1, Value::I8(-3));
    frame.set(2, Value::U64(u64::MAX));
    frame.set(3, Value::Bool(false));
    frame.set(4, Value::Str("hello, world".to_string()));
    frame.set(5, Value::Str(String::new()));
    frame.set(6, Value::OptF32(Some(1.25)));
    frame.set(7, Value::OptF32(None));
    frame.set(8, Value::Timestamp(Timestamp::from_nanos(1_000)));
    frame.set(9, Value::Duration(Duration::from_nanos(-1_000)));

    let bytes = frame.encode();
    let decoded = Frame::decode(&bytes).unwrap();

    assert_eq!(decoded, frame);
    assert_eq!(decoded.get(4), Some(&Value::Str("hello, world".to_string())));
    assert_eq!(decoded.get(5), Some(&Value::Str(String::new())));
}

#[test]
fn fields_decode_in_ascending_key_order() {
    let mut frame = Frame::new(1);
    frame.set(30, Value::U8(1));
    frame.set(10, Value::U8(2));
    frame.set(20, Value::U8(3));

    let keys: Vec<u64> = frame.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![10, 20, 30]);
}
