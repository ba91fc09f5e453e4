use link::OpFuture;
use materialize::{
    serve, Error, LoadIterator, LoadedPublisher, Options, StoreIterator, Transactor, TxnClient,
};
use proto_flow::flow::{self, ConnectorState};
use proto_flow::materialize::{request, response, Request, Response};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use test_support::{doc, packed_key, TestCombiner};

fn key(value: Value) -> Vec<u8> {
    packed_key(&value)
}

fn parse(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

fn spec(delta: &[bool]) -> flow::MaterializationSpec {
    flow::MaterializationSpec {
        name: "acmeCo/materialization".to_string(),
        bindings: delta
            .iter()
            .enumerate()
            .map(|(index, delta)| flow::materialization_spec::Binding {
                collection: format!("acmeCo/collection-{index}"),
                resource_path: vec![format!("table_{index}")],
                delta_updates: *delta,
            })
            .collect(),
    }
}

fn full_range() -> flow::RangeSpec {
    flow::RangeSpec {
        key_begin: 0,
        key_end: u32::MAX,
        r_clock_begin: 0,
        r_clock_end: u32::MAX,
    }
}

struct StagedDoc {
    binding: u32,
    key: Vec<u8>,
    doc: Value,
}

#[derive(Default)]
struct Inner {
    // Store contents which have durably committed.
    committed: Mutex<HashMap<(u32, Vec<u8>), Value>>,
    // Documents staged by store(), applied by the next commit().
    staged: Mutex<Vec<StagedDoc>>,
    staged_checkpoint: Mutex<Vec<u8>>,
    // Record of every Load request and Store document observed.
    loads: Mutex<Vec<(u32, Vec<u8>)>>,
    stored: Mutex<Vec<(u32, Vec<u8>, Value, bool)>>,
    commits: AtomicUsize,
    acks: AtomicUsize,
    // Remote-store-authoritative pattern: await the prior commit
    // before reading the store.
    await_committed: bool,
}

#[derive(Clone, Default)]
struct Fixture(Arc<Inner>);

impl Fixture {
    fn remote_store_authoritative() -> Self {
        Self(Arc::new(Inner {
            await_committed: true,
            ..Default::default()
        }))
    }
}

#[async_trait::async_trait]
impl Transactor for Fixture {
    async fn load(
        &self,
        loads: &mut LoadIterator<'_>,
        prior_committed: OpFuture,
        _prior_acknowledged: OpFuture,
        loaded: &LoadedPublisher,
    ) -> anyhow::Result<()> {
        if self.0.await_committed {
            prior_committed.await.map_err(anyhow::Error::new)?;
        }
        while let Some(load) = loads.next().await {
            let load = load?;
            self.0
                .loads
                .lock()
                .unwrap()
                .push((load.binding, load.packed_key.clone()));

            let found = self
                .0
                .committed
                .lock()
                .unwrap()
                .get(&(load.binding, load.packed_key))
                .cloned();
            if let Some(value) = found {
                loaded.loaded(load.binding, &doc(value)).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<Option<ConnectorState>> {
        Ok(None)
    }

    async fn store(
        &self,
        stores: &mut StoreIterator<'_>,
    ) -> anyhow::Result<Option<ConnectorState>> {
        let mut count = 0;
        while let Some(store) = stores.next().await {
            let store = store?;
            let value = parse(&store.doc_json);

            self.0.stored.lock().unwrap().push((
                store.binding,
                store.packed_key.clone(),
                value.clone(),
                store.exists,
            ));
            self.0.staged.lock().unwrap().push(StagedDoc {
                binding: store.binding,
                key: store.packed_key,
                doc: value,
            });
            count += 1;
        }
        *self.0.staged_checkpoint.lock().unwrap() = stores
            .runtime_checkpoint()
            .unwrap_or_default()
            .to_vec();

        let round = self.0.commits.load(Ordering::SeqCst);
        Ok(Some(ConnectorState {
            updated_json: doc(json!({"stored": count, "round": round})),
            merge_patch: false,
        }))
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let staged: Vec<StagedDoc> = self.0.staged.lock().unwrap().drain(..).collect();
        let mut committed = self.0.committed.lock().unwrap();
        for s in staged {
            committed.insert((s.binding, s.key), s.doc);
        }
        self.0.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn acknowledge(&self) -> anyhow::Result<()> {
        self.0.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn start(
    delta: &[bool],
    options: Options,
    fixture: Fixture,
) -> (
    TxnClient<TestCombiner>,
    tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    let (client, server) = link::pipe::<Request, Response>(16);

    let handle = tokio::spawn(serve(server, {
        let fixture = fixture.clone();
        move |_open: request::Open| async move {
            Ok((
                fixture,
                response::Opened {
                    runtime_checkpoint: b"runtime-cp".to_vec(),
                },
            ))
        }
    }));

    let client = TxnClient::open(
        client,
        spec(delta),
        "v1".to_string(),
        full_range(),
        Vec::new(),
        options,
        |_binding| Ok(TestCombiner::new()),
    )
    .await
    .unwrap();

    (client, handle)
}

// Run one full transaction over `docs`, acknowledging its commit.
async fn transaction(
    client: &mut TxnClient<TestCombiner>,
    docs: &[(u32, Value)],
    checkpoint: &[u8],
) -> Option<ConnectorState> {
    for (binding, value) in docs {
        client
            .add_document(*binding, &packed_key(value), &doc(value.clone()))
            .await
            .unwrap();
    }
    client.flush().await.unwrap();
    client.store().await.unwrap();
    let (state, ack) = client.start_commit(checkpoint.to_vec()).await.unwrap();
    client.acknowledge().await.unwrap();
    ack.await.unwrap();
    state
}

#[tokio::test]
async fn test_delta_and_non_delta_bindings() {
    let fixture = Fixture::default();
    fixture.0.committed.lock().unwrap().insert(
        (0, key(json!(1))),
        json!({"k": 1, "v": "prior"}),
    );

    let (mut client, server_task) =
        start(&[false, true], Options::default(), fixture.clone()).await;
    assert_eq!(client.runtime_checkpoint(), b"runtime-cp");

    let state = transaction(
        &mut client,
        &[
            (0, json!({"k": 1, "v": "one"})),
            (1, json!({"k": 1, "v": "one-d"})),
        ],
        b"cp-1",
    )
    .await
    .unwrap();

    // The connector state of StartedCommit surfaces to the caller.
    assert_eq!(parse(&state.updated_json), json!({"stored": 2, "round": 0}));

    // Binding 0 issued exactly one Load; delta-updates binding 1, none.
    assert_eq!(*fixture.0.loads.lock().unwrap(), vec![(0, key(json!(1)))]);

    // One Store per binding. Binding 0 reduced over the loaded document
    // and is a full reduction; binding 1 is a bare delta.
    assert_eq!(
        *fixture.0.stored.lock().unwrap(),
        vec![
            (0, key(json!(1)), json!({"k": 1, "v": "one"}), true),
            (1, key(json!(1)), json!({"k": 1, "v": "one-d"}), false),
        ]
    );

    // The driver staged the runtime checkpoint of StartCommit.
    assert_eq!(*fixture.0.staged_checkpoint.lock().unwrap(), b"cp-1");

    client.close().await.unwrap();
    server_task.await.unwrap().unwrap();

    // The commit and its acknowledgement both landed.
    assert_eq!(fixture.0.commits.load(Ordering::SeqCst), 1);
    assert!(fixture.0.acks.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_retained_documents_skip_loads() {
    let fixture = Fixture::default();
    let (mut client, server_task) = start(&[false], Options::default(), fixture.clone()).await;

    transaction(
        &mut client,
        &[(0, json!({"k": 1, "n": 1})), (0, json!({"k": 2, "n": 1}))],
        b"cp-1",
    )
    .await;
    assert_eq!(fixture.0.loads.lock().unwrap().len(), 2);

    // Both keys were retained by the first store: the second transaction
    // reduces over the cache without issuing further Loads, and its
    // stored documents are full reductions.
    transaction(
        &mut client,
        &[(0, json!({"k": 1, "n": 2})), (0, json!({"k": 2, "n": 2}))],
        b"cp-2",
    )
    .await;
    assert_eq!(fixture.0.loads.lock().unwrap().len(), 2);

    let stored = fixture.0.stored.lock().unwrap();
    assert_eq!(
        stored[2..].to_vec(),
        vec![
            (0, key(json!(1)), json!({"k": 1, "n": 2}), true),
            (0, key(json!(2)), json!({"k": 2, "n": 2}), true),
        ]
    );
    std::mem::drop(stored);

    client.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_retention_bound_evicts() {
    let fixture = Fixture::default();
    let options = Options {
        cached_document_bound: 1,
        ..Default::default()
    };
    let (mut client, server_task) = start(&[false], options, fixture.clone()).await;

    transaction(
        &mut client,
        &[(0, json!({"k": 1, "n": 1})), (0, json!({"k": 2, "n": 1}))],
        b"cp-1",
    )
    .await;
    assert_eq!(fixture.0.loads.lock().unwrap().len(), 2);

    // Key 1 was retained but key 2 was evicted by the bound,
    // so only key 2 must be loaded again.
    transaction(
        &mut client,
        &[(0, json!({"k": 1, "n": 2})), (0, json!({"k": 2, "n": 2}))],
        b"cp-2",
    )
    .await;
    assert_eq!(
        *fixture.0.loads.lock().unwrap(),
        vec![
            (0, key(json!(1))),
            (0, key(json!(2))),
            (0, key(json!(2))),
        ]
    );

    client.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_read_committed_loads_under_remote_store_pattern() {
    let fixture = Fixture::remote_store_authoritative();
    let options = Options {
        cached_document_bound: 0, // Retain nothing: every key loads.
        ..Default::default()
    };
    let (mut client, server_task) = start(&[false], options, fixture.clone()).await;

    transaction(&mut client, &[(0, json!({"k": 1, "n": 1}))], b"cp-1").await;

    // The transactor defers its store read until the prior transaction's
    // commit, so this load observes the first transaction's document.
    transaction(&mut client, &[(0, json!({"k": 1, "n": 2}))], b"cp-2").await;

    let stored = fixture.0.stored.lock().unwrap();
    assert_eq!(
        stored[1],
        (0, key(json!(1)), json!({"k": 1, "n": 2}), true)
    );
    std::mem::drop(stored);

    client.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transaction_full_defers_to_next() {
    let fixture = Fixture::default();
    let options = Options {
        max_flighted_keys: 2,
        cached_document_bound: 0,
        ..Default::default()
    };
    let (mut client, server_task) = start(&[false], options, fixture.clone()).await;

    client
        .add_document(0, &key(json!(1)), &doc(json!({"k": 1})))
        .await
        .unwrap();
    client
        .add_document(0, &key(json!(2)), &doc(json!({"k": 2})))
        .await
        .unwrap();

    // The transaction is full: the caller must commit and retry.
    let err = client
        .add_document(0, &key(json!(3)), &doc(json!({"k": 3})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionFull));

    // Earlier documents remain committable, and the deferred document
    // lands in the next transaction.
    client.flush().await.unwrap();
    client.store().await.unwrap();
    let (_state, ack) = client.start_commit(b"cp-1".to_vec()).await.unwrap();
    client.acknowledge().await.unwrap();
    ack.await.unwrap();

    transaction(&mut client, &[(0, json!({"k": 3}))], b"cp-2").await;

    assert_eq!(fixture.0.stored.lock().unwrap().len(), 3);

    client.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_flush_requires_prior_acknowledge() {
    let fixture = Fixture::default();
    let (mut client, _server_task) = start(&[false], Options::default(), fixture).await;

    client
        .add_document(0, &key(json!(1)), &doc(json!({"k": 1})))
        .await
        .unwrap();
    client.flush().await.unwrap();
    client.store().await.unwrap();
    let (_state, _ack) = client.start_commit(b"cp-1".to_vec()).await.unwrap();

    // Flushing the next transaction without acknowledging is an error.
    let err = client.flush().await.unwrap_err();
    assert!(matches!(err, Error::MissingAcknowledge));
}

#[tokio::test]
async fn test_server_rejects_flush_before_acknowledge() {
    let (mut client, server) = link::pipe::<Request, Response>(16);
    let handle = tokio::spawn(serve(server, |_open: request::Open| async {
        Ok((Fixture::default(), response::Opened::default()))
    }));

    client
        .send(Request {
            open: Some(request::Open {
                materialization: Some(spec(&[false])),
                version: "v1".to_string(),
                range: Some(full_range()),
                state_json: Vec::new(),
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    let resp = client.recv().await.unwrap().unwrap();
    assert!(resp.opened.is_some());

    // Flush without the opening Acknowledge handshake.
    client
        .send(Request {
            flush: Some(request::Flush {}),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = loop {
        match client.recv().await {
            Some(Err(err)) => break err,
            Some(Ok(_)) => continue,
            None => panic!("expected a terminal stream error"),
        }
    };
    // Either the iterator's protocol error or the cancelled acknowledge
    // task surfaces first.
    let msg = err.to_string();
    assert!(
        msg.contains("Flush precedes the Acknowledge")
            || msg.contains("before the prior transaction was acknowledged"),
        "unexpected error: {msg}"
    );
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn test_state_staged_on_flushed_is_read() {
    // A driver of the older protocol stages its state on Flushed.
    struct OlderDriver(Fixture);

    #[async_trait::async_trait]
    impl Transactor for OlderDriver {
        async fn load(
            &self,
            loads: &mut LoadIterator<'_>,
            prior_committed: OpFuture,
            prior_acknowledged: OpFuture,
            loaded: &LoadedPublisher,
        ) -> anyhow::Result<()> {
            self.0
                .load(loads, prior_committed, prior_acknowledged, loaded)
                .await
        }
        async fn flush(&self) -> anyhow::Result<Option<ConnectorState>> {
            Ok(Some(ConnectorState {
                updated_json: doc(json!({"position": "flushed"})),
                merge_patch: false,
            }))
        }
        async fn store(
            &self,
            stores: &mut StoreIterator<'_>,
        ) -> anyhow::Result<Option<ConnectorState>> {
            let _ = self.0.store(stores).await?;
            Ok(None)
        }
        async fn commit(&self) -> anyhow::Result<()> {
            self.0.commit().await
        }
        async fn acknowledge(&self) -> anyhow::Result<()> {
            self.0.acknowledge().await
        }
    }

    let (client, server) = link::pipe::<Request, Response>(16);
    let _handle = tokio::spawn(serve(server, |_open: request::Open| async {
        Ok((
            OlderDriver(Fixture::default()),
            response::Opened::default(),
        ))
    }));

    let mut client = TxnClient::open(
        client,
        spec(&[true]),
        "v1".to_string(),
        full_range(),
        Vec::new(),
        Options::default(),
        |_binding| Ok(TestCombiner::new()),
    )
    .await
    .unwrap();

    let state = transaction(&mut client, &[(0, json!({"k": 1}))], b"cp-1")
        .await
        .unwrap();
    assert_eq!(parse(&state.updated_json), json!({"position": "flushed"}));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_loaded_key_which_was_not_requested() {
    // A rogue driver responds with a document of a key it was never
    // asked to load.
    struct RogueDriver(Fixture);

    #[async_trait::async_trait]
    impl Transactor for RogueDriver {
        async fn load(
            &self,
            loads: &mut LoadIterator<'_>,
            _prior_committed: OpFuture,
            _prior_acknowledged: OpFuture,
            loaded: &LoadedPublisher,
        ) -> anyhow::Result<()> {
            while let Some(load) = loads.next().await {
                let _ = load?;
            }
            loaded.loaded(0, &doc(json!({"k": 99, "rogue": true}))).await
        }
        async fn flush(&self) -> anyhow::Result<Option<ConnectorState>> {
            Ok(None)
        }
        async fn store(
            &self,
            stores: &mut StoreIterator<'_>,
        ) -> anyhow::Result<Option<ConnectorState>> {
            self.0.store(stores).await
        }
        async fn commit(&self) -> anyhow::Result<()> {
            self.0.commit().await
        }
        async fn acknowledge(&self) -> anyhow::Result<()> {
            self.0.acknowledge().await
        }
    }

    let (client, server) = link::pipe::<Request, Response>(16);
    let _handle = tokio::spawn(serve(server, |_open: request::Open| async {
        Ok((
            RogueDriver(Fixture::default()),
            response::Opened::default(),
        ))
    }));

    let mut client = TxnClient::open(
        client,
        spec(&[false]),
        "v1".to_string(),
        full_range(),
        Vec::new(),
        Options::default(),
        |_binding| Ok(TestCombiner::new()),
    )
    .await
    .unwrap();

    client
        .add_document(0, &key(json!(1)), &doc(json!({"k": 1})))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let err = client.store().await.unwrap_err();
    assert!(matches!(err, Error::LoadedKeyNotRequested { .. }));
}

#[tokio::test]
async fn test_open_rejects_partial_r_clock_range() {
    let (client, _server) = link::pipe::<Request, Response>(16);

    let err = TxnClient::<TestCombiner>::open(
        client,
        spec(&[false]),
        "v1".to_string(),
        flow::RangeSpec {
            key_begin: 0,
            key_end: u32::MAX,
            r_clock_begin: 0,
            r_clock_end: 1 << 31,
        },
        Vec::new(),
        Options::default(),
        |_binding| Ok(TestCombiner::new()),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        Error::Validate(proto_flow::ValidateError::RClockRange { .. })
    ));
}
