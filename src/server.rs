//! things used to make the mixing room server
pub mod peer;
pub mod room;
