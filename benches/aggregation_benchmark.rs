use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::time::Duration;

use don_gateway::aggregation::identical::IdenticalResponseAggregator;
use don_gateway::aggregation::signature::{validate_signatures, SignedResponse};
use don_gateway::aggregation::signer_set::SignerSet;
use don_gateway::api::jsonrpc::JsonRpcResponse;
use don_gateway::crypto::Signer;
use don_gateway::keypair::Keypair;

fn bench_identical_quorum(c: &mut Criterion) {
    let nodes: Vec<String> = (0..7).map(|_| Keypair::new().address()).collect();
    let response = JsonRpcResponse::success(
        "1",
        "vault.get",
        json!({"value": "0123456789abcdef", "height": 1234}),
    );

    c.bench_function("identical responses to quorum of 5 out of 7", |b| {
        b.iter(|| {
            let aggregator = IdenticalResponseAggregator::new(5, Duration::from_secs(60));
            for node in &nodes {
                if aggregator
                    .collect("1", black_box(&response), node)
                    .unwrap()
                    .is_some()
                {
                    break;
                }
            }
        })
    });
}

fn bench_validate_signatures(c: &mut Criterion) {
    let keys: Vec<Keypair> = (0..7).map(|_| Keypair::new()).collect();
    let signers: Vec<&dyn Signer> = keys.iter().map(|key| key as &dyn Signer).collect();
    let signer_set = SignerSet::new(2, keys.iter().map(|key| Signer::public_key(key)));
    let report = SignedResponse::sign(json!({"value": 42}), vec![7; 96], &signers).unwrap();

    c.bench_function("validate 5 of 7 report signatures", |b| {
        b.iter(|| validate_signatures(black_box(&report), &signer_set, 5).unwrap())
    });
}

criterion_group!(benches, bench_identical_quorum, bench_validate_signatures);
criterion_main!(benches);
