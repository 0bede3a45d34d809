pub mod candle_store;
pub mod stream;
pub mod ticker;

pub use candle_store::{interpolate, CandleStore, CandleTable};
pub use stream::{Channel, StreamManager, SubscriptionStatus};
pub use ticker::TickerBoard;
