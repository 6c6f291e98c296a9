pub mod atomic;

pub use atomic::AtomicF64;
