// Engine tests: full committees on tokio over the in-process transport

use fbft::crypto::hash_data;
use fbft::fbft::{
    BlockSink, CommitCertificate, Consensus, ConsensusEngine, ConsensusStatus, EngineError,
    EngineHandle,
};
use fbft::network::{GroupId, LocalHub};
use fbft::{BLSSecretKey, ConsensusConfig, KeyHandle, LocalKey, Member, Roster};
use libp2p::identity::Keypair;
use libp2p::PeerId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testutil::{key_seed, random_block_id};
use tokio::task::JoinHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct RecordingSink {
    commits: Mutex<Vec<CommitCertificate>>,
}

impl RecordingSink {
    fn commits(&self) -> Vec<CommitCertificate> {
        self.commits.lock().unwrap().clone()
    }
}

impl BlockSink for RecordingSink {
    fn committed(&self, certificate: CommitCertificate) {
        self.commits.lock().unwrap().push(certificate);
    }
}

struct Cluster {
    handles: Vec<EngineHandle>,
    tasks: Vec<JoinHandle<()>>,
    sinks: Vec<Arc<RecordingSink>>,
    roster: Roster,
}

fn cluster(n: u32, config: ConsensusConfig, hub: &LocalHub, isolated: &[usize]) -> Cluster {
    let keys: Vec<Arc<LocalKey>> = (0..n)
        .map(|i| Arc::new(LocalKey::new(BLSSecretKey::from_seed(&key_seed(i)).unwrap())))
        .collect();
    let peers: Vec<PeerId> = (0..n)
        .map(|_| Keypair::generate_ed25519().public().to_peer_id())
        .collect();
    let members = (0..n)
        .map(|i| Member::new(i, keys[i as usize].public_key(), peers[i as usize]))
        .collect();
    let roster = Roster::new(1, members, config.committee).unwrap();

    for &node in isolated {
        hub.isolate(peers[node]);
    }

    let group = GroupId::shard(config.shard_id);
    let mut cluster = Cluster {
        handles: Vec::new(),
        tasks: Vec::new(),
        sinks: Vec::new(),
        roster: roster.clone(),
    };
    for (key, peer) in keys.into_iter().zip(peers) {
        let (gateway, inbox) = hub.register(peer, &[group.clone()]);
        let consensus = Consensus::new(config.clone(), roster.clone(), key).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (handle, task) = ConsensusEngine::spawn(consensus, Arc::new(gateway), sink.clone(), inbox);
        cluster.handles.push(handle);
        cluster.tasks.push(task);
        cluster.sinks.push(sink);
    }
    cluster
}

async fn wait_until<F>(handle: &EngineHandle, mut done: F)
where
    F: FnMut(&ConsensusStatus) -> bool,
{
    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(30), status.wait_for(|s| done(s)))
        .await
        .expect("timed out waiting for consensus")
        .expect("engine stopped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_commits_block() {
    init_tracing();
    let hub = LocalHub::new();
    let cluster = cluster(4, ConsensusConfig::default(), &hub, &[]);
    let block = hash_data(b"engine block");

    assert_eq!(cluster.handles[1].status().leader, 1);
    cluster.handles[1].submit_block(block).await.unwrap();

    for handle in &cluster.handles {
        wait_until(handle, |s| s.height >= 2).await;
    }
    for sink in &cluster.sinks {
        let commits = sink.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].block_hash, block);
        assert_eq!(commits[0].height, 1);
        assert!(commits[0].verify(&cluster.roster));
    }

    for handle in &cluster.handles {
        handle.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_replaces_isolated_leader() {
    init_tracing();
    let config = ConsensusConfig {
        base_timeout_ms: 500,
        max_timeout_ms: 8_000,
        ..ConsensusConfig::default()
    };
    let hub = LocalHub::new();
    let cluster = cluster(4, config, &hub, &[1]);

    for node in [0, 2, 3] {
        wait_until(&cluster.handles[node], |s| s.view >= 2).await;
    }

    // Whoever leads the installed view proposes it
    let block = hash_data(&random_block_id());
    for node in [0, 2, 3] {
        cluster.handles[node].submit_block(block).await.unwrap();
    }
    for node in [0, 2, 3] {
        wait_until(&cluster.handles[node], |s| s.height >= 2).await;
        let commits = cluster.sinks[node].commits();
        assert_eq!(commits[0].block_hash, block);
        assert!(commits[0].view >= 2);
    }
    assert!(cluster.sinks[1].commits().is_empty());
}

#[tokio::test]
async fn test_single_member_commits_each_submission() {
    init_tracing();
    let hub = LocalHub::new();
    let mut cluster = cluster(1, ConsensusConfig::default(), &hub, &[]);
    let handle = cluster.handles.remove(0);

    for height in 1..=3u64 {
        handle
            .submit_block(hash_data(&height.to_be_bytes()))
            .await
            .unwrap();
        wait_until(&handle, |s| s.height > height).await;
    }
    let heights: Vec<u64> = cluster.sinks[0].commits().iter().map(|c| c.height).collect();
    assert_eq!(heights, vec![1, 2, 3]);

    handle.shutdown().await.unwrap();
    cluster.tasks.remove(0).await.unwrap();
    assert_eq!(
        handle.submit_block(hash_data(b"late")).await,
        Err(EngineError::Stopped)
    );
}
