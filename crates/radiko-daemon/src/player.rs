//! Interactive line-driven player (`radiko play`).
//!
//! Reads one command per line from stdin and drives a `PlaybackController`
//! whose single consumer is the ffplay audio sink.  Volume, station and area
//! changes are written through to the persisted state.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use radiko_proto::config::Config;
use radiko_proto::protocol::ReconnectStatus;
use radiko_proto::state::StateManager;
use radiko_stream::{
    FfmpegLauncher, PlaybackController, PlaybackSettings, RadikoResolver, RecordingToggle,
    UpstreamResolver,
};

use crate::audio::FfplaySink;

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    VolumeUp,
    VolumeDown,
    SetVolume(f64),
    Mute,
    Record,
    Play(String),
    List,
    Area(String),
    Status,
    Help,
    Quit,
}

impl PlayerCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (head, arg) = match line.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (line, ""),
        };
        match head {
            "+" => Ok(Self::VolumeUp),
            "-" => Ok(Self::VolumeDown),
            "m" => Ok(Self::Mute),
            "r" => Ok(Self::Record),
            "l" => Ok(Self::List),
            "s" | "" => Ok(Self::Status),
            "h" | "?" => Ok(Self::Help),
            "q" => Ok(Self::Quit),
            "p" if !arg.is_empty() => Ok(Self::Play(arg.to_uppercase())),
            "p" => Err("usage: p <STATION_ID>".into()),
            "a" if is_valid_area(arg) => Ok(Self::Area(arg.to_uppercase())),
            "a" => Err("usage: a <JP1..JP47>".into()),
            d if d.len() == 1 && d.as_bytes()[0].is_ascii_digit() => {
                Ok(Self::SetVolume(f64::from(d.as_bytes()[0] - b'0') / 10.0))
            }
            other => Err(format!("unknown command '{}' (h for help)", other)),
        }
    }
}

/// `JP1` .. `JP47`, case-insensitive.
pub fn is_valid_area(area: &str) -> bool {
    let upper = area.to_uppercase();
    upper
        .strip_prefix("JP")
        .and_then(|n| n.parse::<u8>().ok())
        .is_some_and(|n| (1..=47).contains(&n))
}

const HELP: &str = "\
commands:
  +  -        volume up / down
  0..9        volume 0%..90%
  m           mute / unmute
  r           start / stop recording
  p <ID>      play station (e.g. p QRR)
  l           list stations in the current area
  a <JPnn>    change area (e.g. a JP27)
  s           status
  q           quit";

pub struct Player {
    config: Config,
    resolver: Arc<RadikoResolver>,
    controller: PlaybackController,
    state: StateManager,
    station_names: HashMap<String, String>,
}

impl Player {
    pub fn new(config: Config, state: StateManager) -> anyhow::Result<Self> {
        let resolver = Arc::new(RadikoResolver::new(config.radiko.clone())?);
        let controller = PlaybackController::new(
            PlaybackSettings::from_config(&config),
            resolver.clone(),
            Arc::new(FfmpegLauncher::new()),
        );
        Ok(Self {
            config,
            resolver,
            controller,
            state,
            station_names: HashMap::new(),
        })
    }

    pub async fn run(mut self, initial_station: Option<String>) -> anyhow::Result<()> {
        let persisted = self.state.get_state().await;
        self.resolver.set_area_id(&self.config.radiko.area_id);
        self.controller.set_volume(persisted.volume);
        self.spawn_status_watcher();

        println!("{}", HELP);
        let station = initial_station.unwrap_or(persisted.last_station_id);
        if let Err(e) = self.switch_to(&station).await {
            println!("could not play {}: {:#}", station, e);
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down player");
                    break;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match PlayerCommand::parse(&line) {
                        Ok(PlayerCommand::Quit) => break,
                        Ok(cmd) => {
                            if let Err(e) = self.handle(cmd).await {
                                warn!("Player command failed: {:#}", e);
                                println!("error: {:#}", e);
                            }
                        }
                        Err(msg) => println!("{}", msg),
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle(&mut self, cmd: PlayerCommand) -> anyhow::Result<()> {
        let step = self.config.playback.volume_step;
        match cmd {
            PlayerCommand::VolumeUp => {
                let v = self.controller.increase_volume(step);
                self.persist_volume(v).await;
            }
            PlayerCommand::VolumeDown => {
                let v = self.controller.decrease_volume(step);
                self.persist_volume(v).await;
            }
            PlayerCommand::SetVolume(v) => {
                let v = self.controller.set_volume(v);
                self.persist_volume(v).await;
            }
            PlayerCommand::Mute => {
                let muted = self.controller.toggle_mute();
                println!("{}", if muted { "muted" } else { "unmuted" });
                self.persist_volume(self.controller.volume()).await;
            }
            PlayerCommand::Record => {
                let label = self
                    .controller
                    .current_station()
                    .unwrap_or_else(|| "radiko".to_string());
                match self.controller.toggle_recording(&label).await? {
                    RecordingToggle::Started(path) => println!("recording to {}", path.display()),
                    RecordingToggle::Stopped(path) => println!("saved {}", path.display()),
                }
            }
            PlayerCommand::Play(station) => self.switch_to(&station).await?,
            PlayerCommand::List => {
                let area = self.resolver.area_id();
                let stations = self.resolver.list_stations(&area).await?;
                println!("{} stations in {}:", stations.len(), area);
                for s in &stations {
                    println!("  {:<12} {}", s.id, s.name);
                }
                self.station_names = stations.into_iter().map(|s| (s.id, s.name)).collect();
            }
            PlayerCommand::Area(area) => {
                self.resolver.set_area_id(&area);
                self.state.set_area(&area).await?;
                // Later recordings need a token issued for the new area.
                if self.controller.is_playing() {
                    let token = self.resolver.authenticate().await?;
                    self.controller.update_auth_token(&token);
                }
                println!("area set to {}", area);
            }
            PlayerCommand::Status => self.print_status().await,
            PlayerCommand::Help => println!("{}", HELP),
            PlayerCommand::Quit => {}
        }
        Ok(())
    }

    /// Resolve first so a bad station leaves current playback alone; then
    /// stop the old stream before starting the new one.
    async fn switch_to(&mut self, station: &str) -> anyhow::Result<()> {
        let stream = self.resolver.resolve(station).await?;
        if self.controller.is_playing() {
            self.controller.stop().await?;
        }
        let sink = FfplaySink::open(
            self.config.playback.sample_rate,
            self.config.playback.channels,
        )?;
        self.controller.play(station, stream, Box::new(sink)).await?;
        self.state
            .record_playback(station, self.controller.volume())
            .await?;
        match self.station_names.get(station) {
            Some(name) => println!("playing {} ({})", station, name),
            None => println!("playing {}", station),
        }
        Ok(())
    }

    async fn persist_volume(&self, volume: f64) {
        println!("volume {:.0}%", volume * 100.0);
        if let Err(e) = self.state.set_volume(volume).await {
            warn!("Failed to save volume: {:#}", e);
        }
    }

    async fn print_status(&self) {
        let snap = self.controller.snapshot().await;
        let mut line = match &snap.station_id {
            Some(id) => format!("{} | vol {:.0}%", id, snap.volume * 100.0),
            None => format!("stopped | vol {:.0}%", snap.volume * 100.0),
        };
        if snap.muted {
            line.push_str(" (muted)");
        }
        if let Some(rec) = &snap.recording {
            let secs = rec.elapsed().as_secs();
            line.push_str(&format!(
                " | rec {} {:02}:{:02}:{:02}",
                rec.path.display(),
                secs / 3600,
                (secs / 60) % 60,
                secs % 60
            ));
        }
        if let Some(label) = snap.reconnect_status.label() {
            line.push_str(&format!(" | {}", label));
        }
        if let Some(err) = &snap.last_error {
            line.push_str(&format!(" | error: {}", err));
        }
        println!("{}", line);
    }

    fn spawn_status_watcher(&self) {
        let mut statuses = self.controller.subscribe();
        let controller = self.controller.clone();
        tokio::spawn(async move {
            loop {
                match statuses.recv().await {
                    Ok(status) => {
                        if let Some(label) = status.label() {
                            println!("[{}]", label);
                        }
                        match status {
                            ReconnectStatus::Succeeded => controller.clear_reconnect_status(),
                            ReconnectStatus::Failed => {
                                let reason = controller.last_error().unwrap_or_default();
                                error!("Playback stopped: {}", reason);
                                println!("playback stopped: {} (p <ID> to retry)", reason);
                            }
                            _ => {}
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn shutdown(&self) {
        if self.controller.is_playing() {
            if let Err(e) = self.controller.stop().await {
                warn!("Failed to stop playback: {}", e);
            }
        }
        if self.controller.recording_info().await.is_some() {
            match self.controller.stop_recording().await {
                Ok(path) => println!("saved {}", path.display()),
                Err(e) => warn!("Failed to stop recording: {}", e),
            }
        }
        info!("Player exited");
    }
}
