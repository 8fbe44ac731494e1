//! Tree passes run before code generation
//!
//! | Pass | Effect |
//! |------|--------|
//! | [`ConstantFolder`] | literal-only expressions and dead branches |
//! | [`ApplyToCallRewriter`] | `f.apply(x, arguments)` becomes a direct call |
//! | [`TypeFinalizer`] | final slot or scope storage for every symbol |
//! | [`ProgramPointAssigner`] | ids for optimistic-capable nodes |

pub mod apply;
pub mod finalize;
pub mod fold;
pub mod program_points;
pub mod scope;

pub use apply::{ApplyToCallRewriter, Environment, StaticEnvironment};
pub use finalize::{infer_scope_needs, TypeFinalizer};
pub use fold::{fold_binary, fold_unary, ConstantFolder, FoldStats};
pub use program_points::{program_points, ProgramPointAssigner, FIRST_PROGRAM_POINT};
pub use scope::{Frame, ScopeTracker};
