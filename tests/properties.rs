use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::{Value, json};
use sigforge::{
    Field, FieldKind, FieldType, FieldValues, Signature, StreamingExtractor, extract_all,
};

const NAME: &str = "[a-z][a-z0-9_]{0,6}";

fn value_type() -> BoxedStrategy<FieldType> {
    prop_oneof![
        Just(FieldType::String),
        Just(FieldType::Number),
        Just(FieldType::Boolean),
        Just(FieldType::Json),
        Just(FieldType::Date),
        Just(FieldType::DateTime),
        prop::collection::vec("[a-z]{1,6}", 1..4).prop_map(FieldType::Class),
    ]
    .boxed()
}

fn input_type() -> BoxedStrategy<FieldType> {
    prop_oneof![
        4 => value_type(),
        1 => Just(FieldType::Image),
        1 => Just(FieldType::Audio),
    ]
    .boxed()
}

fn description() -> impl Strategy<Value = Option<String>> {
    prop::option::of(r#"[a-zA-Z0-9 ,.'"\\-]{0,24}"#)
}

type FieldParts = (FieldType, bool, bool, bool, Option<String>);

fn build_field(name: String, (field_type, array, optional, internal, desc): FieldParts) -> Field {
    let media = field_type.is_media();
    let mut field = Field::new(name).typed(field_type);
    if array && !media {
        field = field.array();
    }
    if optional {
        field = field.optional();
    }
    if internal {
        field = field.internal();
    }
    if let Some(desc) = desc {
        field = field.describe(desc);
    }
    field
}

fn fields(types: BoxedStrategy<FieldType>, internal: bool) -> impl Strategy<Value = Vec<Field>> {
    prop::collection::btree_set(NAME, 1..4).prop_flat_map(move |names| {
        let parts = (types.clone(), any::<bool>(), any::<bool>(), any::<bool>(), description())
            .prop_map(move |(t, a, o, i, d)| (t, a, o, i && internal, d));
        let count = names.len();
        (Just(names), prop::collection::vec(parts, count))
            .prop_map(|(names, parts)| {
                names.into_iter().zip(parts).map(|(n, p)| build_field(n, p)).collect()
            })
    })
}

fn signature() -> impl Strategy<Value = Signature> {
    (
        prop::option::of("[A-Za-z][A-Za-z ]{0,20}"),
        fields(input_type(), false),
        fields(value_type(), true),
    )
        .prop_map(|(desc, inputs, outputs)| {
            let mut sig = Signature::new();
            if let Some(desc) = desc {
                sig = sig.describe(desc);
            }
            sig.inputs = inputs;
            sig.outputs = outputs;
            sig
        })
}

/// Splits `text` at the given cut points. `text` is ASCII.
fn split(text: &str, cuts: &[Index]) -> Vec<String> {
    let mut points: Vec<usize> = cuts.iter().map(|i| i.index(text.len() + 1)).collect();
    points.push(0);
    points.push(text.len());
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|w| text[w[0]..w[1]].to_string()).collect()
}

fn answer_fields() -> Vec<Field> {
    let dsl = "q -> title, tags:string[], score:number, done:boolean, note?";
    dsl.parse::<Signature>().unwrap().outputs
}

prop_compose! {
    fn answer()(
        title in "[a-zA-Z]{1,10}( [a-zA-Z]{1,10}){0,2}",
        tags in prop::collection::vec("[a-z]{1,8}", 1..5),
        score in -1000i64..1000,
        done in any::<bool>(),
        note in prop::option::of("[a-z]{1,10}"),
    ) -> (String, FieldValues) {
        let mut text = format!("Title: {title}\nTags:\n");
        for tag in &tags {
            text.push_str(&format!("- {tag}\n"));
        }
        text.push_str(&format!("Score: {score}\nDone: {done}"));
        let mut expected = json!({"title": title, "tags": tags, "score": score, "done": done});
        if let Some(note) = note {
            text.push_str(&format!("\nNote: {note}"));
            expected["note"] = json!(note);
        }
        (text, expected.as_object().cloned().unwrap())
    }
}

proptest! {
    #[test]
    fn prop_signature_round_trip(sig in signature()) {
        prop_assert!(sig.validate().is_ok());
        let rendered = sig.to_string();
        let reparsed = rendered
            .parse::<Signature>()
            .map_err(|e| TestCaseError::fail(format!("{rendered}: {e}")))?;
        prop_assert_eq!(&reparsed, &sig);
        prop_assert_eq!(reparsed.to_string(), rendered);
    }

    #[test]
    fn prop_chunking_does_not_change_values(
        (text, expected) in answer(),
        cuts in prop::collection::vec(any::<Index>(), 0..12),
    ) {
        let fields = answer_fields();
        let whole = extract_all(&fields, &text).unwrap();
        prop_assert_eq!(&whole, &expected);

        let mut extractor = StreamingExtractor::new(&fields);
        for chunk in split(&text, &cuts) {
            extractor.push(&chunk).unwrap();
        }
        extractor.finish().unwrap();
        prop_assert_eq!(extractor.values(), &expected);
    }

    #[test]
    fn prop_finalized_values_never_change(
        (text, _) in answer(),
        cuts in prop::collection::vec(any::<Index>(), 0..12),
    ) {
        let fields = answer_fields();
        let mut extractor = StreamingExtractor::new(&fields);
        let mut emitted: Vec<(String, Value)> = Vec::new();

        for chunk in split(&text, &cuts) {
            for field in extractor.push(&chunk).unwrap() {
                if let Some(value) = field.value {
                    emitted.push((field.name, value));
                }
            }
            for (name, value) in &emitted {
                prop_assert_eq!(extractor.values().get(name), Some(value));
            }
        }
        extractor.finish().unwrap();
        for (name, value) in &emitted {
            prop_assert_eq!(extractor.values().get(name), Some(value));
        }
    }
}

#[test]
fn test_array_split_inside_an_item() {
    let fields = answer_fields();
    let mut extractor = StreamingExtractor::new(&fields);
    for chunk in ["Title: t\nTags:\n- al", "pha\n-", " beta\nSc", "ore: 1\nDone: true"] {
        extractor.push(chunk).unwrap();
    }
    extractor.finish().unwrap();
    assert_eq!(extractor.values()["tags"], json!(["alpha", "beta"]));
    assert_eq!(fields[1].kind, FieldKind::Array);
}
