//! Graph-based virtual overlay network: a directed graph of logical
//! communication endpoints mapped onto physical peers, with typed message
//! passing over its edges.
//!
//! The [`Cage`] bundles a graph, a transport and the directory built by the
//! collective announce. A minimal peer looks like:
//!
//! ```no_run
//! use gvon::{mapping, pattern, Cage};
//! use gvon::shm;
//!
//! let _results = shm::spawn(2, |comm| {
//!     let mut cage: Cage<_> = Cage::new(comm, &pattern::Chain { vertex_count: 2 })
//!         .expect("pattern should build");
//!     cage.distribute(&mapping::Consecutive).expect("announce");
//!     for vertex in cage.hosted_vertices().to_vec() {
//!         for edge in cage.out_edges(vertex.id).expect("vertex is hosted") {
//!             cage.send(edge, &[1u64, 2, 3]).expect("send");
//!         }
//!     }
//! });
//! ```

mod cage;
mod directory;
mod error;
mod serialize;

pub use cage::{Cage, Incoming};
pub use directory::Directory;
pub use error::CageError;
pub use serialize::{ByteCast, Forward, SerializationPolicy};

pub use gvon_comm::{shm, socket, CommError, Communicator, Context, Event, Status};
pub use gvon_graph::{mapping, pattern, Edge, Graph, GraphDescription, GraphError, Vertex};
pub use gvon_types::{ContextId, EdgeId, GraphId, ReduceOp, Reducible, Tag, VAddr, VertexId};
