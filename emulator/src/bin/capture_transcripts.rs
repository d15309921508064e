use std::io;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;
#[allow(dead_code)]
#[path = "../sim.rs"]
mod sim;

use session::{Session, TranscriptProfile};

fn main() -> io::Result<()> {
    record_profile(TranscriptProfile::Motion)?;
    record_profile(TranscriptProfile::Update)?;
    record_profile(TranscriptProfile::Recovery)?;
    Ok(())
}

fn record_profile(profile: TranscriptProfile) -> io::Result<()> {
    let mut session = Session::new(profile)?;
    let script: &[&str] = match profile {
        TranscriptProfile::Motion => &[
            "door closed",
            "advance 2s",
            "motion",
            "advance 400",
            "motion",
            "advance 700",
            "status",
            "led LED_PULSATING_BLUE",
            "advance 300",
            "publish node/indicator/set LED_RAINBOW",
            "door error",
            "advance 2s",
            "telemetry",
        ],
        TranscriptProfile::Update => &[
            "fetch chunks 20",
            "fetch fail-begin 1",
            "fetch fail-chunks 2",
            "update",
            "update",
            "advance 1500",
            "status",
            "advance 2s",
            "status",
        ],
        TranscriptProfile::Recovery => &[
            "broker off",
            "bus drop",
            "advance 6s",
            "broker on",
            "advance 6s",
            "link off",
            "link drop",
            "advance 10s",
            "link on",
            "advance 6s",
            "status",
            "bus error 0x7780",
            "status",
        ],
    };
    for line in script {
        session.handle_command(line)?;
    }
    Ok(())
}
