//! Integration tests for the portable value codec.

use deferq::codec::{self, Value};
use deferq::model::{Call, DeferralOptions, Dispatch, RunnerSpec};
use deferq::{Error, Job, JobReference};
use serde::Serialize;
use std::time::Duration;

fn spec() -> RunnerSpec {
    RunnerSpec {
        kind: "fibonacci".to_string(),
        name: "fib1".to_string(),
        priority: 1024,
        time_to_run: Duration::from_secs(120),
        record_return_values: true,
        push_progress_updates: false,
    }
}

#[test]
fn jobs_and_references_survive_the_wire() {
    let job = Job::new(42, "mem");
    let value = Value::List(vec![
        Value::Job(job.clone()),
        Value::Ref(JobReference::new(job.clone())),
        Value::missing(),
    ]);

    let decoded = codec::decode(&codec::encode(&value).unwrap()).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(decoded.as_list().unwrap()[1].as_reference().unwrap().dereference(), &job);
    assert!(decoded.as_list().unwrap()[2].is_missing());
}

#[test]
fn dispatch_payload_carries_receiver_and_call() {
    let dispatch = Dispatch {
        receiver: spec(),
        call: Call::Deferred {
            method: "add_together".to_string(),
            jobs: vec![Job::new(1, "mem"), Job::new(2, "mem")],
            options: DeferralOptions::default().halt_on_data_loss(false),
            args: vec![Value::Int(3)],
        },
    };

    let text = codec::encode_dispatch(&dispatch).unwrap();
    assert!(text.contains(r#""call":"deferred""#));
    assert_eq!(codec::decode_dispatch(&text).unwrap(), dispatch);
}

#[test]
fn dispatch_with_unportable_args_is_rejected() {
    let dispatch = Dispatch {
        receiver: spec(),
        call: Call::Process {
            method: "fibonacci".to_string(),
            args: vec![Value::List(vec![Value::Float(f64::INFINITY)])],
        },
    };
    assert!(matches!(
        codec::encode_dispatch(&dispatch),
        Err(Error::NoRemoteRepresentation(_))
    ));
}

#[test]
fn structs_have_no_portable_form() {
    #[derive(Serialize)]
    struct Point {
        x: i32,
        y: i32,
    }
    let err = codec::to_value(&Point { x: 1, y: 2 }).unwrap_err();
    assert!(matches!(err, Error::NoRemoteRepresentation(msg) if msg.contains('x')));
}

#[test]
fn out_of_range_integer_has_no_portable_form() {
    assert!(matches!(
        codec::to_value(&u64::MAX),
        Err(Error::NoRemoteRepresentation(_))
    ));
    assert_eq!(codec::to_value(&(i64::MAX as u64)).unwrap(), Value::Int(i64::MAX));
}

#[test]
fn decoding_garbage_is_a_codec_error() {
    assert!(matches!(codec::decode("not json"), Err(Error::Codec(_))));
    assert!(matches!(codec::decode(r#"{"t":"lambda","v":"x"}"#), Err(Error::Codec(_))));
}
