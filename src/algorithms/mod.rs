pub mod fixed_window;
pub mod sliding_window;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowRedisLimiter;
