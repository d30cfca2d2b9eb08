use paramserve::table::{Column, ColumnMeta};
use paramserve::value::{TypeTag, Value};
use paramserve::Table;

fn columns() -> Vec<Column> {
    vec![
        Column {
            id: 1,
            tag: TypeTag::U64,
            meta: ColumnMeta::new("timestamp_ns"),
        },
        Column {
            id: 2,
            tag: TypeTag::Str,
            meta: ColumnMeta::new("event"),
        },
        Column {
            id: 3,
            tag: TypeTag::OptI32,
            meta: ColumnMeta::new("code"),
        },
    ]
}

#[test]
fn table_survives_encode_then_embed_in_a_frame() {
    let mut table = paramserve::Table::new(columns()).unwrap();
    table
        .append_row(vec![
            Value::U64(1),
            Value::Str("started".to_string()),
            Value::OptI32(None),
        ])
        .unwrap();
    table
        .append_row(vec![
            Value::U64(2),
            Value::Str("stopped".to_string()),
            Value::OptI32(Some(-1)),
        ])
        .unwrap();

    let blob = table.encode();
    let mut frame = paramserve::Frame::new(1);
    frame.set(1, Value::TableBlob(blob));

    let bytes = frame.encode();
    let decoded_frame = paramserve::Frame::decode(&bytes).unwrap();
    let decoded_blob = match decoded_frame.get(1).unwrap() {
        Value::TableBlob(b) => b,
        _ => panic!("expected a table blob"),
    };

    let decoded = Table::decode(decoded_blob, columns()).unwrap();
    assert_eq!(decoded.row_count(), 2);
    assert_eq!(decoded.row(1).unwrap()[2], Value::OptI32(Some(-1)));
}

#[test]
fn copy_from_clones_rows_between_same_schema_tables() {
    let mut src = Table::new(columns()).unwrap();
    src.append_row(vec![
        Value::U64(9),
        Value::Str("x".to_string()),
        Value::OptI32(None),
    ])
    .unwrap();

    let blob = src.encode();
    let mut dest = Table::new(columns()).unwrap();
    dest.copy_from(&blob).unwrap();
    assert_eq!(dest.row_count(), 1);
    assert_eq!(dest.encoded_len(), src.encoded_len());
}
