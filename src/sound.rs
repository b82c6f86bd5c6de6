//! components used on the client side of a session

use crate::common::box_error::BoxError;

/// callback the sound card integration drives once per hardware block
pub trait SoundCallback {
    fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError>;
}

pub mod audio_buffer;
pub mod client;
