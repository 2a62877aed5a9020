//! Tier-2 middle-end for the Helion JIT.
//!
//! The crate owns the data-flow graph representation (`dfg`) and the
//! speculative constant-folding / strength-reduction phase that runs over it.
//! Bytecode lowering, tiering policy, and code generation live in the
//! embedding engine; they hand us a graph plus read-only snapshots of the
//! structure registry and inline-cache profiles, and get back a mutated
//! graph together with the assumptions the caller must watch.

pub mod dfg;
