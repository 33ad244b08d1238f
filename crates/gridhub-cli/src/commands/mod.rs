pub mod element;
pub mod lock;
pub mod net;
pub mod project;
pub mod ts;
pub mod variant;
