//! Terminal tones

use async_trait::async_trait;
use duet_core::tone::ToneError;
use duet_core::{ToneRole, ToneSink};
use std::io::Write;

/// Rings the terminal bell; prints the tone when the bell can't be written
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

#[async_trait]
impl ToneSink for TerminalBell {
    async fn play(&self, role: ToneRole) -> Result<(), ToneError> {
        let mut out = std::io::stdout().lock();
        out.write_all(b"\x07")
            .and_then(|()| out.flush())
            .map_err(|e| ToneError::Playback(format!("{role:?}: {e}")))
    }

    async fn play_fallback(&self, role: ToneRole) -> Result<(), ToneError> {
        match role {
            ToneRole::Ringtone => println!("   🔔 ring ring"),
            ToneRole::Ringback => println!("   … ringing"),
        }
        Ok(())
    }
}
