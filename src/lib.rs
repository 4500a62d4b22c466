pub mod backends;
pub mod dtype;
pub mod module;
pub mod numeric_tensor;
pub mod ops;
pub mod traced_graph;
pub mod traced_module;
pub mod tracer;
pub mod tree;

pub use backends::eval_backend::EvalBackend;
pub use backends::ndarray_backend::NDArrayNumericTensor;
pub use module::{Attr, Module, ModuleRef, ModuleRegistry, Signature, UserFunction, UserFunctionRef};
pub use numeric_tensor::NumericTensor;
pub use traced_graph::InternalGraph;
pub use traced_module::{ModuleTree, trace_module};
pub use tracer::{Context, TraceError, Value};
pub use tree::{CallArgs, Literal, Tree, TreeDef};
