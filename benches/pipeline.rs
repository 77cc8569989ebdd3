//! Benchmark for the network handler pipeline
//!
//! Full recomputation over meshes of growing size.

use clusterlink_manager::crd::{
    ClusterLinkStatus, ClusterStatus, IpFamilyType, Role,
};
use clusterlink_manager::{
    Cluster, ClusterLinkOptions, ClusterNode, ClusterNodeSpec, ClusterSpec, ManagerConfig,
    NetworkManager, NetworkType,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn cluster(index: usize, network_type: NetworkType) -> Cluster {
    let mut cluster = Cluster::new(
        &format!("member{}", index),
        ClusterSpec {
            namespace: "kosmos-system".into(),
            cluster_link_options: Some(ClusterLinkOptions {
                network_type,
                ip_family: IpFamilyType::Ipv4,
                ..Default::default()
            }),
        },
    );
    cluster.status = Some(ClusterStatus {
        cluster_link_status: ClusterLinkStatus {
            pod_cidrs: vec![format!("10.{}.0.0/16", index)],
            service_cidrs: vec![format!("172.{}.0.0/16", 16 + index)],
        },
    });
    cluster
}

fn node(cluster: usize, index: usize, gateway: bool) -> ClusterNode {
    let name = format!("node{}", index);
    ClusterNode::new(
        &format!("member{}-{}", cluster, name),
        ClusterNodeSpec {
            node_name: name,
            cluster_name: format!("member{}", cluster),
            ip: format!("192.168.{}.{}", cluster, index + 1),
            interface_name: "eth0".into(),
            pod_cidrs: vec![format!("10.{}.{}.0/24", cluster, index)],
            roles: if gateway { vec![Role::Gateway] } else { vec![] },
            ..Default::default()
        },
    )
}

/// Half p2p clusters, half gateway clusters with one gateway each
fn mesh(clusters: usize, nodes_per_cluster: usize) -> (Vec<Cluster>, Vec<ClusterNode>) {
    let mut all_clusters = Vec::new();
    let mut all_nodes = Vec::new();
    for c in 0..clusters {
        let network_type = if c % 2 == 0 { NetworkType::P2P } else { NetworkType::Gateway };
        all_clusters.push(cluster(c, network_type));
        for n in 0..nodes_per_cluster {
            all_nodes.push(node(c, n, network_type == NetworkType::Gateway && n == 0));
        }
    }
    (all_clusters, all_nodes)
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20);

    for (clusters, nodes) in [(2, 5), (4, 10), (8, 20)] {
        let (cluster_list, node_list) = mesh(clusters, nodes);
        group.throughput(Throughput::Elements(node_list.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("calculate_network_configs", format!("{}x{}", clusters, nodes)),
            &(cluster_list, node_list),
            |b, (cluster_list, node_list)| {
                let manager = NetworkManager::new(ManagerConfig {
                    psk_seed: "bench".into(),
                });
                b.iter(|| {
                    let results = manager.calculate_network_configs(
                        black_box(cluster_list.clone()),
                        black_box(node_list.clone()),
                        Vec::new(),
                    );
                    black_box(results)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
