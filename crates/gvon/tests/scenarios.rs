//! End-to-end scenarios running one peer per thread over the in-process
//! backend.

use gvon::shm::{self, ShmCommunicator};
use gvon::{mapping, pattern, Cage, CageError, GraphDescription, ReduceOp, VAddr, VertexId};

fn cage(
    comm: ShmCommunicator,
    pattern: &impl pattern::Pattern,
    mapping: &impl mapping::Mapping,
) -> Cage<ShmCommunicator> {
    let mut cage = Cage::new(comm, pattern).expect("pattern should build");
    cage.distribute(mapping).expect("distribute should succeed");
    cage
}

#[test]
fn chain_of_four_delivers_across_peers() {
    shm::spawn(4, |comm| {
        let cage = cage(
            comm,
            &pattern::Chain { vertex_count: 4 },
            &mapping::Consecutive,
        );
        assert_eq!(cage.hosted_vertices().len(), 1);
        let mine = cage.hosted_vertices()[0];

        if mine.id == VertexId(0) {
            let edge = cage
                .edge_between(VertexId(0), VertexId(1))
                .expect("chain edge 0->1");
            cage.send(edge, &[1u64, 2, 3]).expect("send");
        }
        if mine.id == VertexId(1) {
            let edge = cage
                .edge_between(VertexId(0), VertexId(1))
                .expect("chain edge 0->1");
            let mut buf = [0u64; 3];
            cage.recv(edge, &mut buf).expect("recv");
            assert_eq!(buf, [1, 2, 3]);
        }
    });
}

#[test]
fn bi_star_request_reply() {
    let transcripts = shm::spawn(4, |comm| {
        let cage = cage(
            comm,
            &pattern::BiStar { vertex_count: 4 },
            &mapping::Consecutive,
        );
        let mine = cage.hosted_vertices()[0];
        let mut transcript = Vec::new();

        if mine.id == VertexId(0) {
            for request_edge in cage.in_edges(mine.id).expect("hub is a vertex") {
                let mut hello = [0u8; 5];
                cage.recv(request_edge, &mut hello).expect("recv request");
                transcript.push(format!(
                    "Received {}",
                    std::str::from_utf8(&hello).expect("request is utf8")
                ));
                let reply_edge = cage
                    .edge_inverse(request_edge)
                    .expect("bi-star edges run both ways");
                cage.send(reply_edge, b"World").expect("send reply");
            }
        } else {
            for request_edge in cage.out_edges(mine.id).expect("leaf is a vertex") {
                cage.send(request_edge, b"Hello").expect("send request");
                let reply_edge = cage
                    .edge_inverse(request_edge)
                    .expect("bi-star edges run both ways");
                let mut world = [0u8; 5];
                cage.recv(reply_edge, &mut world).expect("recv reply");
                transcript.push(format!(
                    "Received {}",
                    std::str::from_utf8(&world).expect("reply is utf8")
                ));
            }
        }
        transcript
    });

    assert_eq!(
        transcripts[0],
        vec!["Received Hello"; 3],
        "server sees one request per leaf"
    );
    for client in &transcripts[1..] {
        assert_eq!(client, &vec!["Received World"]);
    }
}

#[test]
fn grid_neighbors_exchange_vectors_asynchronously() {
    shm::spawn(9, |comm| {
        let cage = cage(
            comm,
            &pattern::Grid {
                width: 3,
                height: 3,
            },
            &mapping::Consecutive,
        );
        let mine = cage.hosted_vertices()[0];
        let payload = [5u64; 10];

        let mut sends = Vec::new();
        for edge in cage.out_edges(mine.id).expect("vertex is hosted") {
            sends.push(cage.async_send(edge, &payload).expect("async_send"));
        }
        let mut recvs = Vec::new();
        for edge in cage.in_edges(mine.id).expect("vertex is hosted") {
            recvs.push(cage.async_recv::<u64>(edge, 10).expect("async_recv"));
        }

        for mut event in sends {
            event.wait().expect("send should complete");
        }
        for incoming in recvs {
            let mut buf = [0u64; 10];
            incoming.wait_into(&mut buf).expect("recv should complete");
            assert_eq!(buf, payload);
        }
    });
}

#[test]
fn hyper_cube_one_hop_broadcast() {
    shm::spawn(2, |comm| {
        let cage = cage(
            comm,
            &pattern::HyperCube { dimension: 3 },
            &mapping::Roundrobin,
        );
        assert_eq!(cage.graph().vertex_count(), 8);
        assert_eq!(cage.graph().edge_count(), 24);
        assert_eq!(cage.hosted_vertices().len(), 4);

        let origin = cage.vertex(VertexId(0)).expect("vertex 0 exists");
        if cage
            .hosted_vertices()
            .iter()
            .any(|vertex| *vertex == origin)
        {
            cage.spread(origin, &[42u32]).expect("spread");
        }
        for vertex in cage.hosted_vertices().to_vec() {
            if (vertex.id.0 ^ 0).count_ones() == 1 {
                let edge = cage
                    .edge_between(VertexId(0), vertex.id)
                    .expect("one-hop edge from the origin");
                let mut buf = [0u32; 1];
                cage.recv(edge, &mut buf).expect("recv");
                assert_eq!(buf, [42]);
            }
        }
    });
}

#[test]
fn random_mapping_announce_agrees_on_the_full_table() {
    let tables = shm::spawn(4, |comm| {
        let cage = cage(
            comm,
            &pattern::EdgeLess { vertex_count: 10 },
            &mapping::Random { seed: 1234 },
        );
        let owners: Vec<VAddr> = (0..10)
            .map(|vertex| {
                cage.directory()
                    .vaddr_of(VertexId(vertex))
                    .expect("every vertex has an owner")
            })
            .collect();
        (cage.hosted_vertices().to_vec(), owners)
    });

    // Hosted sets are a disjoint cover of [0, 10).
    let mut seen = [false; 10];
    for (hosted, _) in &tables {
        for vertex in hosted {
            assert!(!seen[vertex.id.0], "vertex hosted twice");
            seen[vertex.id.0] = true;
        }
    }
    assert!(seen.iter().all(|hosted| *hosted));

    // All peers agree on the owner table.
    for (_, owners) in &tables[1..] {
        assert_eq!(owners, &tables[0].1);
    }
}

#[test]
fn any_recv_reports_the_arrival_edge() {
    shm::spawn(2, |comm| {
        let cage = cage(
            comm,
            &pattern::Chain { vertex_count: 2 },
            &mapping::Consecutive,
        );
        let mine = cage.hosted_vertices()[0];

        if mine.id == VertexId(0) {
            let edge = cage
                .edge_between(VertexId(0), VertexId(1))
                .expect("chain edge");
            cage.send(edge, &[9u16, 8, 7]).expect("send");
        } else {
            let mut buf = [0u16; 3];
            let edge = cage.recv_any(&mut buf).expect("recv_any");
            assert_eq!(edge.source.id, VertexId(0));
            assert_eq!(edge.target.id, VertexId(1));
            assert_eq!(buf, [9, 8, 7]);
        }
    });
}

#[test]
fn graph_scope_collectives_and_reductions() {
    shm::spawn(3, |comm| {
        let cage = cage(
            comm,
            &pattern::Ring { vertex_count: 3 },
            &mapping::Consecutive,
        );
        let mine = cage.hosted_vertices()[0];
        let contribution = [mine.id.0 as u64 + 1];

        let mut max = [0u64];
        cage.all_reduce(ReduceOp::Max, &contribution, &mut max)
            .expect("all_reduce");
        assert_eq!(max, [3]);

        let mut sum = [0u64];
        cage.all_reduce(ReduceOp::Sum, &contribution, &mut sum)
            .expect("all_reduce");
        assert_eq!(sum, [6]);

        let root = cage.vertex(VertexId(1)).expect("vertex 1 exists");
        let mut gathered = [0u64; 3];
        cage.gather(root, &contribution, &mut gathered)
            .expect("gather");
        if mine.id == VertexId(1) {
            assert_eq!(gathered, [1, 2, 3]);
        }

        let mut value = [0u64];
        if mine.id == VertexId(1) {
            value = [31];
        }
        cage.broadcast(root, &mut value).expect("broadcast");
        assert_eq!(value, [31]);

        cage.barrier().expect("barrier");
    });
}

#[test]
fn edge_less_graphs_fail_point_to_point_but_keep_collectives() {
    shm::spawn(2, |comm| {
        let cage = cage(
            comm,
            &pattern::EdgeLess { vertex_count: 2 },
            &mapping::Consecutive,
        );
        assert!(cage.edge_between(VertexId(0), VertexId(1)).is_none());

        // A fabricated edge value is rejected as unknown.
        let fake = gvon::Edge {
            id: gvon::EdgeId(0),
            source: gvon::Vertex { id: VertexId(0) },
            target: gvon::Vertex { id: VertexId(1) },
        };
        let err = cage.send(fake, &[1u8]).expect_err("no edges exist");
        assert!(matches!(err, CageError::UnknownEdge(_)));

        let mut sum = [0u32];
        cage.all_reduce(ReduceOp::Sum, &[1u32], &mut sum)
            .expect("collectives are unaffected");
        assert_eq!(sum, [2]);
    });
}

#[test]
fn single_peer_self_loop_routes_to_itself() {
    shm::spawn(1, |comm| {
        let description: GraphDescription = GraphDescription {
            vertices: vec![(VertexId(0), ())],
            edges: vec![((VertexId(0), VertexId(0)), ())],
        };
        let graph = gvon::Graph::from_description(description).expect("self-loop builds");
        let mut cage: Cage<ShmCommunicator> = Cage::with_graph(comm, graph);
        cage.distribute(&mapping::Consecutive).expect("distribute");

        let edge = cage
            .edge_between(VertexId(0), VertexId(0))
            .expect("self-loop edge");
        cage.send(edge, &[11u8, 22]).expect("send to self");
        let mut buf = [0u8; 2];
        cage.recv(edge, &mut buf).expect("recv from self");
        assert_eq!(buf, [11, 22]);
    });
}

#[test]
fn inverse_of_inverse_is_the_original_edge() {
    shm::spawn(1, |comm| {
        let cage = cage(
            comm,
            &pattern::BiStar { vertex_count: 3 },
            &mapping::Consecutive,
        );
        for vertex in cage.graph().vertices() {
            for edge in cage.out_edges(vertex.id).expect("vertex exists") {
                let inverse = cage.edge_inverse(edge).expect("bi-star edges run both ways");
                assert_eq!(
                    cage.edge_inverse(inverse).expect("inverse exists"),
                    edge
                );
            }
        }
    });
}

#[test]
fn subgraph_announce_builds_a_sub_context() {
    shm::spawn(4, |comm| {
        let mut cage = Cage::<ShmCommunicator>::new(
            comm,
            &pattern::EdgeLess { vertex_count: 4 },
        )
        .expect("pattern should build");
        cage.distribute(&mapping::Consecutive).expect("distribute");
        let mine = cage.hosted_vertices()[0];

        // The subgraph names parent vertices 0 and 1; their owners get a
        // context, everyone else gets none.
        let description: GraphDescription = GraphDescription {
            vertices: vec![(VertexId(0), ()), (VertexId(1), ())],
            edges: vec![],
        };
        let subgraph = gvon::Graph::from_description(description).expect("subgraph builds");
        let sub_ctx = cage.announce_subgraph(&subgraph).expect("announce");
        match mine.id {
            VertexId(0) | VertexId(1) => {
                let ctx = sub_ctx.expect("owner peers join the sub-context");
                assert_eq!(ctx.size(), 2);
            }
            _ => assert!(sub_ctx.is_none()),
        }
    });
}
