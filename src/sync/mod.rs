pub mod bitmap;
pub mod lock;
pub mod semset;
pub mod spinlock;
