mod sim;

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use clap::Parser;
use embassy_executor::{Executor, Spawner};
use embassy_time::{Duration, Ticker};
use kiwi_core::utils::{
    controllers::{
        DriveActuator, MotionCommand, PulseCounter, RobotConfig, RobotController, SenseChannel,
        Tick,
    },
    time::Instant,
};
use serde::Deserialize;
use sim::{Line, SimDirPin, SimPwm, SimSensePin};
use static_cell::StaticCell;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type SimMotor = DriveActuator<SimPwm, SimDirPin>;

#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// JSON robot configuration; defaults to the reference robot
    #[clap(long)]
    config: Option<PathBuf>,
    /// override the proportional gain
    #[clap(long)]
    kp: Option<f32>,
    /// control tick period in milliseconds
    #[clap(long, default_value_t = 20)]
    dt_ms: u64,
    /// duration of each motion step of the built-in script
    #[clap(long, default_value_t = 3000)]
    step_ms: u64,
    /// JSON list of `{ "command": ..., "duration_ms": ... }` steps to run instead
    #[clap(long)]
    script: Option<PathBuf>,
    /// single-channel encoders (direction taken from the drive output)
    #[clap(long)]
    blind: bool,
    /// CSV telemetry output
    #[clap(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Step {
    command: MotionCommand,
    duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to create CSV output: {0}")]
    Output(#[from] io::Error),
    #[error("robot setup failed: {0}")]
    Robot(String),
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<T, SetupError> {
    let text = std::fs::read_to_string(path).map_err(|source| SetupError::Read {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| SetupError::Parse {
        path: path.clone(),
        source,
    })
}

/// Forward at 0.5 m/s, pause, then forward at 0.2 m/s while turning clockwise.
fn default_script(step_ms: u64) -> Vec<Step> {
    vec![
        Step {
            command: MotionCommand::Holonomic {
                speed: 0.5,
                angle: 90.0,
                omega: 0.0,
            },
            duration_ms: step_ms,
        },
        Step {
            command: MotionCommand::Stop,
            duration_ms: 1000,
        },
        Step {
            command: MotionCommand::NonHolonomic {
                vx: 0.0,
                vy: 0.2,
                omega: -45.0,
            },
            duration_ms: step_ms,
        },
        Step {
            command: MotionCommand::Stop,
            duration_ms: 0,
        },
    ]
}

/// The control core's view of the embassy clock.
fn now() -> Instant {
    Instant::from_ticks(embassy_time::Instant::now().as_micros() as u32)
}

enum EncoderInputs {
    Quadrature([SenseChannel<'static, SimSensePin>; 3]),
    Blind(&'static [PulseCounter; 3]),
}

struct CsvLog {
    out: BufWriter<File>,
    start: embassy_time::Instant,
}

impl CsvLog {
    fn create(path: &PathBuf) -> io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "time_s")?;
        for m in 1..=3 {
            write!(out, ",m{m}_target_rpm,m{m}_current_rpm,m{m}_output")?;
        }
        writeln!(out)?;
        Ok(Self {
            out,
            start: embassy_time::Instant::now(),
        })
    }

    fn row(
        &mut self,
        robot: &RobotController<'static, SimMotor>,
    ) -> io::Result<()> {
        let t = self.start.elapsed().as_micros() as f64 / 1e6;
        write!(self.out, "{t:.3}")?;
        for w in robot.wheels() {
            write!(self.out, ",{:.3},{:.3},{:.1}", w.target_rpm, w.current_rpm, w.drive_output)?;
        }
        writeln!(self.out)
    }
}

#[embassy_executor::task]
async fn encoder_task(
    mut inputs: EncoderInputs,
    config: RobotConfig,
) -> ! {
    const STEP_US: u64 = 1000;
    let mut ticker = Ticker::every(Duration::from_micros(STEP_US));
    loop {
        ticker.next().await;
        let start = now();
        let edges = sim::step(STEP_US as f32 / 1e6, &config.geometry);
        for (wheel, offsets) in edges.iter().enumerate() {
            for offset in offsets {
                let at = start + kiwi_core::utils::time::micros((offset * STEP_US as f32) as u32);
                match &mut inputs {
                    EncoderInputs::Quadrature(channels) => {
                        // Infallible pins
                        let _ = channels[wheel].on_rising_edge(at);
                    }
                    EncoderInputs::Blind(counters) => {
                        counters[wheel].on_rising_edge(at, None);
                    }
                }
            }
        }
    }
}

#[embassy_executor::task]
async fn control_task(
    mut robot: RobotController<'static, SimMotor>,
    script: Vec<Step>,
    dt_ms: u64,
    mut csv: Option<CsvLog>,
) {
    let mut ticker = Ticker::every(Duration::from_millis(dt_ms));
    for step in script {
        if let Err(e) = robot.execute(step.command) {
            error!("command {:?} failed: {}", step.command, e);
        }
        let step_end = embassy_time::Instant::now() + Duration::from_millis(step.duration_ms);
        while embassy_time::Instant::now() < step_end {
            ticker.next().await;
            match robot.update(now()) {
                Ok(Tick::Applied { .. }) => {
                    if let Some(log) = csv.as_mut() {
                        if let Err(e) = log.row(&robot) {
                            warn!("dropping CSV output: {}", e);
                            csv = None;
                        }
                    }
                }
                Ok(Tick::Skipped) => {}
                Err(e) => error!("control tick failed: {}", e),
            }
        }
        let (vx, vy, w) = robot.measured_body_velocity();
        info!(
            command = ?step.command,
            vx,
            vy,
            w,
            plant_rpm = ?sim::wheel_rpms(),
            "step finished"
        );
    }

    if let Err(e) = robot.stop() {
        error!("final stop failed: {}", e);
    }
    if let Some(mut log) = csv {
        if let Err(e) = log.out.flush() {
            error!("failed to flush CSV output: {}", e);
        }
    }
    info!("script complete");
    std::process::exit(0);
}

struct Setup {
    robot: RobotController<'static, SimMotor>,
    inputs: EncoderInputs,
    config: RobotConfig,
    script: Vec<Step>,
    csv: Option<CsvLog>,
}

fn setup(opts: &Opts) -> Result<Setup, SetupError> {
    let mut config = match &opts.config {
        Some(path) => load_json::<RobotConfig>(path)?,
        None => RobotConfig::default(),
    };
    if let Some(kp) = opts.kp {
        config.kp = kp;
    }
    let script = match &opts.script {
        Some(path) => load_json::<Vec<Step>>(path)?,
        None => default_script(opts.step_ms),
    };

    static COUNTERS: StaticCell<[PulseCounter; 3]> = StaticCell::new();
    let counters: &'static [PulseCounter; 3] = if opts.blind {
        COUNTERS.init([config.blind_counter(), config.blind_counter(), config.blind_counter()])
    } else {
        COUNTERS.init([
            config.quadrature_counter(),
            config.quadrature_counter(),
            config.quadrature_counter(),
        ])
    };

    let motors = [0, 1, 2].map(|wheel| {
        DriveActuator::new(
            SimPwm::new(wheel, config.pwm_frequency_hz),
            SimDirPin::new(wheel, Line::In1),
            SimDirPin::new(wheel, Line::In2),
        )
    });
    let [Ok(m1), Ok(m2), Ok(m3)] = motors else {
        return Err(SetupError::Robot("motor bring-up failed".into()));
    };

    let robot = RobotController::new(
        &config,
        [m1, m2, m3],
        [&counters[0], &counters[1], &counters[2]],
        now(),
    )
    .map_err(|e| SetupError::Robot(e.to_string()))?;

    let inputs = if opts.blind {
        EncoderInputs::Blind(counters)
    } else {
        let forward = config.sense_forward_level();
        EncoderInputs::Quadrature(core::array::from_fn(|wheel| {
            SenseChannel::new(&counters[wheel], SimSensePin::new(wheel, forward))
        }))
    };

    let csv = opts.out.as_ref().map(CsvLog::create).transpose()?;

    Ok(Setup {
        robot,
        inputs,
        config,
        script,
        csv,
    })
}

#[embassy_executor::task]
async fn main_task(
    spawner: Spawner,
    setup: Setup,
    dt_ms: u64,
) {
    let Setup {
        robot,
        inputs,
        config,
        script,
        csv,
    } = setup;

    let mode = match inputs {
        EncoderInputs::Blind(_) => "blind",
        EncoderInputs::Quadrature(_) => "quadrature",
    };
    info!(steps = script.len(), dt_ms, mode, "starting simulation");
    spawner.spawn(encoder_task(inputs, config)).unwrap();
    spawner.spawn(control_task(robot, script, dt_ms, csv)).unwrap();
}

static EXECUTOR: StaticCell<Executor> = StaticCell::new();

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts: Opts = Opts::parse();
    let setup = match setup(&opts) {
        Ok(setup) => setup,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        spawner.spawn(main_task(spawner, setup, opts.dt_ms)).unwrap();
    });
}
