use capture::lifecycle::{stage_push_documents, write_push_checkpoint};
use capture::{PushOptions, PushServer};
use proto_flow::capture::{push_request, push_response, Documents, PushRequest, PushResponse};
use proto_flow::flow::{self, DriverCheckpoint, Slice};
use proto_flow::Combiner;
use serde_json::{json, Value};
use test_support::{doc, TestCombiner};

fn spec() -> flow::CaptureSpec {
    flow::CaptureSpec {
        name: "acmeCo/capture".to_string(),
        bindings: vec![flow::capture_spec::Binding {
            collection: "acmeCo/collection".to_string(),
            resource_path: vec!["a-table".to_string()],
        }],
    }
}

fn patch(value: Value) -> DriverCheckpoint {
    DriverCheckpoint {
        driver_checkpoint_json: value.to_string().into_bytes(),
        rfc7396_merge_patch: true,
    }
}

fn documents(binding: u32, docs: &[Value]) -> Documents {
    let mut arena = Vec::new();
    let mut docs_json = Vec::new();
    for d in docs {
        let begin = arena.len() as u32;
        arena.extend_from_slice(&doc(d.clone()));
        docs_json.push(Slice {
            begin,
            end: arena.len() as u32,
        });
    }
    Documents {
        binding,
        arena,
        docs_json,
    }
}

fn drain(combiner: &mut TestCombiner) -> Vec<Value> {
    let mut out = Vec::new();
    combiner
        .drain(&mut |d| {
            out.push(serde_json::from_slice(d.doc_json).unwrap());
            Ok(())
        })
        .unwrap();
    out
}

async fn open_push(
    options: PushOptions,
) -> (
    PushServer<TestCombiner>,
    link::Client<PushRequest, PushResponse>,
) {
    let (mut client, server) = link::pipe::<PushRequest, PushResponse>(16);

    client
        .send(PushRequest {
            open: Some(push_request::Open {
                capture: "acmeCo/capture".to_string(),
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    let server = PushServer::open(
        server,
        spec(),
        0,
        u32::MAX,
        br#"{"resume": true}"#.to_vec(),
        options,
        |_binding| Ok(TestCombiner::new()),
    )
    .await
    .unwrap();

    let resp = client.recv().await.unwrap().unwrap();
    let opened = resp.opened.unwrap();
    assert_eq!(opened.status(), push_response::Status::Ok);
    assert_eq!(opened.driver_checkpoint_json, br#"{"resume": true}"#);

    (server, client)
}

#[tokio::test]
async fn test_push_with_combining() {
    let (mut server, _wire) = open_push(PushOptions::default()).await;

    let mut ack1 = server
        .push(vec![documents(0, &[json!("a")])], patch(json!({"x": 1})))
        .await
        .unwrap();
    let ack2 = server
        .push(vec![documents(0, &[json!("b")])], patch(json!({"y": 1})))
        .await
        .unwrap();

    // First transaction: push one commits alone.
    let mut commit = server.next_commit().await.unwrap().unwrap();
    assert_eq!(drain(&mut commit.combiners()[0]), vec![json!("a")]);
    assert_eq!(
        commit.driver_checkpoint().driver_checkpoint_json,
        json!({"x": 1}).to_string().into_bytes()
    );
    let (op, fut) = link::async_op();
    commit.set_log_committed_op(fut);

    // Push one is acknowledged only once its commit op resolves.
    assert!(ack1.try_recv().is_err());
    op.resolve(Ok(()));
    ack1.await.unwrap();

    // Second transaction: push two.
    let mut commit = server.next_commit().await.unwrap().unwrap();
    assert_eq!(drain(&mut commit.combiners()[0]), vec![json!("b")]);
    let (op, fut) = link::async_op();
    commit.set_log_committed_op(fut);
    op.resolve(Ok(()));
    ack2.await.unwrap();

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_push_over_the_wire() {
    let (mut server, client) = open_push(PushOptions::default()).await;
    let (mut tx, mut rx) = client.into_parts();

    let mut current = None;
    for d in ["w1", "w2"] {
        stage_push_documents(&mut tx, &mut current, 0, &doc(json!(d)))
            .await
            .unwrap();
    }
    write_push_checkpoint(&mut tx, &mut current, patch(json!({"wire": 1})))
        .await
        .unwrap();

    let mut commit = server.next_commit().await.unwrap().unwrap();
    assert_eq!(
        drain(&mut commit.combiners()[0]),
        vec![json!("w1"), json!("w2")]
    );
    let (op, fut) = link::async_op();
    commit.set_log_committed_op(fut);
    op.resolve(Ok(()));

    // The wire producer is acknowledged after the commit.
    let resp = rx.recv().await.unwrap().unwrap();
    assert!(resp.acknowledge.is_some());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_push_threshold_defers_but_commits_all() {
    let (mut server, _wire) = open_push(PushOptions {
        combiner_byte_threshold: 1,
        ..Default::default()
    })
    .await;

    // Each pushed transaction exceeds the threshold, so pushes are
    // declined while a commit is in flight, and every push still commits.
    let pusher = server.pusher();
    let producer = tokio::spawn(async move {
        let mut acks = Vec::new();
        for n in 1..=3u32 {
            let ack = pusher
                .push(
                    vec![documents(0, &[json!(format!("doc-{n}"))])],
                    patch(json!({ "n": n })),
                )
                .await
                .unwrap();
            acks.push(ack);
        }
        acks
    });

    for expect in ["doc-1", "doc-2", "doc-3"] {
        let mut commit = server.next_commit().await.unwrap().unwrap();
        assert_eq!(drain(&mut commit.combiners()[0]), vec![json!(expect)]);
        let (op, fut) = link::async_op();
        commit.set_log_committed_op(fut);
        op.resolve(Ok(()));
    }

    for ack in producer.await.unwrap() {
        ack.await.unwrap();
    }
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_push_open_of_unknown_capture() {
    let (mut client, server) = link::pipe::<PushRequest, PushResponse>(16);

    client
        .send(PushRequest {
            open: Some(push_request::Open {
                capture: "acmeCo/other".to_string(),
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = PushServer::<TestCombiner>::open(
        server,
        spec(),
        0,
        u32::MAX,
        Vec::new(),
        PushOptions::default(),
        |_binding| Ok(TestCombiner::new()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, capture::Error::CaptureNotFound(_)));

    let resp = client.recv().await.unwrap().unwrap();
    assert_eq!(
        resp.opened.unwrap().status(),
        push_response::Status::CaptureNotFound
    );
}
