use core::convert::Infallible;

use embedded_hal::{
    digital::{ErrorType as PinErrorType, OutputPin, PinState},
    pwm::{ErrorType as PwmErrorType, SetDutyCycle},
};
use embedded_hal_mock::eh1::{
    digital::{Mock as PinMock, State as PinMockState, Transaction as PinTrans},
    pwm::{Mock as PwmMock, Transaction as PwmTrans},
};
use kiwi_core::utils::{
    controllers::{
        ConfigError, DriveActuator, DriveCommand, DrivePhase, Edge, MotionCommand, MotorDirection,
        PulseCounter, RobotConfig, RobotController, RobotError, SenseChannel, Tick, WheelDrive,
    },
    math::kinematics::{GeometryError, RobotGeometry},
    time::Instant,
};

/// Full-scale duty of the reference PWM channels.
pub const MAX_DUTY: u16 = 65535;

fn at_ms(ms: u32) -> Instant {
    Instant::from_ticks(ms * 1_000)
}

fn at_us(us: u32) -> Instant {
    Instant::from_ticks(us)
}

/// Build an actuator over mocks and return the clones used to verify them.
fn mock_actuator(
    pwm: &[PwmTrans],
    in1: &[PinTrans],
    in2: &[PinTrans],
) -> (
    DriveActuator<PwmMock, PinMock>,
    (PwmMock, PinMock, PinMock),
) {
    let en = PwmMock::new(pwm);
    let a = PinMock::new(in1);
    let b = PinMock::new(in2);
    let handles = (en.clone(), a.clone(), b.clone());
    (DriveActuator::new(en, a, b).unwrap(), handles)
}

fn done(handles: &mut (PwmMock, PinMock, PinMock)) {
    handles.0.done();
    handles.1.done();
    handles.2.done();
}

#[test]
fn test_actuator_starts_stopped() {
    let (motor, mut handles) = mock_actuator(
        &[PwmTrans::max_duty_cycle(MAX_DUTY), PwmTrans::set_duty_cycle(0)],
        &[PinTrans::set(PinMockState::Low)],
        &[PinTrans::set(PinMockState::Low)],
    );
    assert_eq!(motor.direction(), MotorDirection::Stopped);
    assert_eq!(motor.max_duty(), MAX_DUTY);
    done(&mut handles);
}

#[test]
fn test_actuator_normalized_and_raw_share_magnitude() {
    let (mut motor, mut handles) = mock_actuator(
        &[
            PwmTrans::max_duty_cycle(MAX_DUTY),
            PwmTrans::set_duty_cycle(0),
            PwmTrans::set_duty_cycle(32768),
            PwmTrans::set_duty_cycle(32768),
            PwmTrans::set_duty_cycle(32768),
        ],
        &[
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::High),
            PinTrans::set(PinMockState::High),
            PinTrans::set(PinMockState::Low),
        ],
        &[
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::High),
        ],
    );

    motor.set_normalized_duty(0.5).unwrap();
    assert_eq!((motor.direction(), motor.duty()), (MotorDirection::Forward, 32768));
    motor.set_raw_duty(32768.0).unwrap();
    assert_eq!((motor.direction(), motor.duty()), (MotorDirection::Forward, 32768));
    motor.set_normalized_duty(-0.5).unwrap();
    assert_eq!((motor.direction(), motor.duty()), (MotorDirection::Reverse, 32768));
    done(&mut handles);
}

#[test]
fn test_actuator_zero_duty_stops_regardless_of_sign() {
    let (mut motor, mut handles) = mock_actuator(
        &[
            PwmTrans::max_duty_cycle(MAX_DUTY),
            PwmTrans::set_duty_cycle(0),
            PwmTrans::set_duty_cycle(0),
            PwmTrans::set_duty_cycle(0),
        ],
        &[
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::Low),
        ],
        &[
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::Low),
            PinTrans::set(PinMockState::Low),
        ],
    );

    motor.drive(DriveCommand::Raw(0.0)).unwrap();
    // rounds to zero duty
    motor.drive(DriveCommand::Raw(-0.3)).unwrap();
    assert_eq!(motor.direction(), MotorDirection::Stopped);
    assert_eq!(motor.duty(), 0);
    done(&mut handles);
}

#[test]
fn test_actuator_saturates_raw_duty() {
    let (mut motor, mut handles) = mock_actuator(
        &[
            PwmTrans::max_duty_cycle(MAX_DUTY),
            PwmTrans::set_duty_cycle(0),
            PwmTrans::set_duty_cycle(MAX_DUTY),
        ],
        &[PinTrans::set(PinMockState::Low), PinTrans::set(PinMockState::Low)],
        &[PinTrans::set(PinMockState::Low), PinTrans::set(PinMockState::High)],
    );

    motor.set_raw_duty(-250_000.0).unwrap();
    assert_eq!(motor.duty(), MAX_DUTY);
    done(&mut handles);
}

#[test]
fn test_sense_channel_samples_b() {
    let counter = PulseCounter::quadrature(PinState::Low);
    let pin_b = PinMock::new(&[
        PinTrans::get(PinMockState::Low),
        PinTrans::get(PinMockState::Low),
        PinTrans::get(PinMockState::High),
    ]);
    let mut check = pin_b.clone();
    let mut channel = SenseChannel::new(&counter, pin_b);

    assert_eq!(channel.on_rising_edge(at_us(1_000)).unwrap(), Edge::Counted(1));
    assert_eq!(channel.on_rising_edge(at_us(2_000)).unwrap(), Edge::Counted(1));
    assert_eq!(channel.on_rising_edge(at_us(3_000)).unwrap(), Edge::Counted(-1));
    assert_eq!(counter.get_count(), 1);
    check.done();
}

// --- robot-level scenarios over recording fakes ---

#[derive(Default)]
struct FakePwm {
    duty: u16,
}

impl PwmErrorType for FakePwm {
    type Error = Infallible;
}

impl SetDutyCycle for FakePwm {
    fn max_duty_cycle(&self) -> u16 {
        MAX_DUTY
    }

    fn set_duty_cycle(
        &mut self,
        duty: u16,
    ) -> Result<(), Self::Error> {
        self.duty = duty;
        Ok(())
    }
}

#[derive(Default)]
struct FakePin {
    high: bool,
}

impl PinErrorType for FakePin {
    type Error = Infallible;
}

impl OutputPin for FakePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        Ok(())
    }
}

type FakeMotor = DriveActuator<FakePwm, FakePin>;

fn fake_motor() -> FakeMotor {
    DriveActuator::new(FakePwm::default(), FakePin::default(), FakePin::default()).unwrap()
}

fn robot<'a>(
    kp: f32,
    counters: &'a [PulseCounter; 3],
) -> RobotController<'a, FakeMotor> {
    let config = RobotConfig {
        kp,
        ..RobotConfig::default()
    };
    RobotController::new(
        &config,
        [fake_motor(), fake_motor(), fake_motor()],
        [&counters[0], &counters[1], &counters[2]],
        at_ms(0),
    )
    .unwrap()
}

fn blind_counters() -> [PulseCounter; 3] {
    [
        PulseCounter::direction_blind(),
        PulseCounter::direction_blind(),
        PulseCounter::direction_blind(),
    ]
}

/// Fire `n` well-spaced edges on every counter, starting at `start_us`.
fn pulse_all(
    counters: &[PulseCounter; 3],
    start_us: u32,
    n: u32,
) {
    for c in counters {
        for k in 0..n {
            assert_eq!(c.on_rising_edge(at_us(start_us + k * 300), None), Edge::Counted(1));
        }
    }
}

fn assert_rpms_close(
    a: [f32; 3],
    b: [f32; 3],
) {
    for i in 0..3 {
        assert!((a[i] - b[i]).abs() < 1e-3, "wheel {}: {} != {}", i, a[i], b[i]);
    }
}

#[test]
fn test_holonomic_forward_matches_non_holonomic() {
    let counters = blind_counters();
    let mut a = robot(10.0, &counters);
    let mut b = robot(10.0, &counters);
    a.holonomic(0.25, 90.0, 0.0).unwrap();
    b.non_holonomic(0.0, 0.25, 0.0).unwrap();
    assert_rpms_close(a.target_rpms(), b.target_rpms());
}

#[test]
fn test_zero_speed_zero_targets() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    for angle in [0.0, 37.0, 90.0, 181.0, 359.0] {
        r.holonomic(0.0, angle, 0.0).unwrap();
        assert_rpms_close(r.target_rpms(), [0.0; 3]);
    }
}

#[test]
fn test_stop_is_idempotent() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.holonomic(0.3, 45.0, 20.0).unwrap();
    pulse_all(&counters, 1_000, 3);
    assert!(matches!(r.update(at_ms(20)).unwrap(), Tick::Applied { driven: true, .. }));

    for _ in 0..3 {
        r.stop().unwrap();
        assert_eq!(r.phase(), DrivePhase::Stopped);
        assert_eq!(r.target_rpms(), [0.0; 3]);
        assert_eq!(r.drive_outputs(), [0.0; 3]);
        for m in r.motors() {
            assert_eq!(m.duty(), 0);
            assert_eq!(m.direction(), MotorDirection::Stopped);
        }
    }
}

#[test]
fn test_tick_gating() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.holonomic(0.1, 90.0, 0.0).unwrap();

    assert!(matches!(r.update(at_ms(10)).unwrap(), Tick::Applied { .. }));
    let outputs = r.drive_outputs();
    let duties: Vec<u16> = r.motors().iter().map(|m| m.duty()).collect();

    pulse_all(&counters, 10_500, 4);
    assert_eq!(r.update(at_ms(19)).unwrap(), Tick::Skipped);
    assert_eq!(r.last_update(), at_ms(10));
    assert_eq!(r.drive_outputs(), outputs);
    assert_eq!(r.motors().iter().map(|m| m.duty()).collect::<Vec<_>>(), duties);

    assert!(matches!(r.update(at_ms(20)).unwrap(), Tick::Applied { .. }));
    assert_eq!(r.last_update(), at_ms(20));
}

#[test]
fn test_clock_going_backwards_skips() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.update(at_ms(50)).unwrap();
    assert_eq!(r.update(at_ms(40)).unwrap(), Tick::Skipped);
    assert_eq!(r.last_update(), at_ms(50));
}

#[test]
fn test_end_to_end_scenario() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.holonomic(0.1, 90.0, 0.0).unwrap();
    assert_eq!(r.phase(), DrivePhase::Commanded);

    for tick in 1..=5u32 {
        pulse_all(&counters, tick * 20_000 - 15_000, 5);
        let outcome = r.update(at_ms(tick * 20)).unwrap();
        match outcome {
            Tick::Applied { dt_s, driven } => {
                assert!((dt_s - 0.02).abs() < 1e-6);
                assert!(driven);
            }
            Tick::Skipped => panic!("tick {} skipped", tick),
        }
    }

    assert_eq!(r.phase(), DrivePhase::Running);
    assert!(r.drive_outputs().iter().any(|&p| p != 0.0));
    assert!(r.motors().iter().any(|m| m.duty() > 0));
    // 5 pulses / 330 per rev over 20 ms
    let expected = 5.0 / 330.0 / 0.02 * 60.0;
    assert!((r.current_rpms()[0].abs() - expected).abs() < 1e-2);
    for out in r.drive_outputs() {
        assert!(out.abs() <= MAX_DUTY as f32);
    }
}

#[test]
fn test_blind_counter_takes_sign_of_drive() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    // wheel 1 (330°) spins backwards for a backwards command
    r.non_holonomic(0.0, -0.1, 0.0).unwrap();
    r.update(at_ms(20)).unwrap();
    assert!(r.drive_outputs()[0] < 0.0);

    pulse_all(&counters, 25_000, 5);
    r.update(at_ms(40)).unwrap();
    assert!(r.current_rpms()[0] < 0.0);
}

#[test]
fn test_blind_counter_keeps_sign_after_stop() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.non_holonomic(0.0, -0.1, 0.0).unwrap();
    r.update(at_ms(20)).unwrap();
    assert!(r.drive_outputs()[0] < 0.0);
    assert!(r.drive_outputs()[2] > 0.0);
    r.stop().unwrap();
    assert_eq!(r.drive_outputs(), [0.0; 3]);

    // wheels coast on in the direction they were last driven
    pulse_all(&counters, 25_000, 5);
    r.update(at_ms(40)).unwrap();
    assert!(r.wheels()[0].reverse);
    assert!(r.current_rpms()[0] < 0.0);
    assert!(r.current_rpms()[2] > 0.0);
}

#[test]
fn test_quadrature_counter_keeps_own_sign() {
    let counters = [
        PulseCounter::quadrature(PinState::Low),
        PulseCounter::quadrature(PinState::Low),
        PulseCounter::quadrature(PinState::Low),
    ];
    let mut r = robot(10.0, &counters);
    r.non_holonomic(0.0, 0.1, 0.0).unwrap();
    for k in 0..5 {
        counters[0].on_rising_edge(at_us(5_000 + k * 300), Some(PinState::High));
    }
    r.update(at_ms(20)).unwrap();
    assert!(r.current_rpms()[0] < 0.0);
    assert_eq!(r.wheels()[0].last_count, -5);
}

#[test]
fn test_stopped_robot_is_not_driven() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.holonomic(0.2, 0.0, 0.0).unwrap();
    r.update(at_ms(20)).unwrap();
    r.stop().unwrap();

    pulse_all(&counters, 25_000, 5);
    let outcome = r.update(at_ms(40)).unwrap();
    assert!(matches!(outcome, Tick::Applied { driven: false, .. }));
    assert!(r.current_rpms()[0] > 0.0);
    assert_eq!(r.drive_outputs(), [0.0; 3]);
    assert!(r.motors().iter().all(|m| m.duty() == 0));

    r.execute(MotionCommand::Holonomic {
        speed: 0.2,
        angle: 0.0,
        omega: 0.0,
    })
    .unwrap();
    assert_eq!(r.phase(), DrivePhase::Commanded);
}

#[test]
fn test_idle_robot_is_not_driven() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    assert_eq!(r.phase(), DrivePhase::Idle);
    let outcome = r.update(at_ms(20)).unwrap();
    assert!(matches!(outcome, Tick::Applied { driven: false, .. }));
    assert_eq!(r.phase(), DrivePhase::Idle);
}

#[test]
fn test_non_finite_command_is_rejected() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.holonomic(0.1, 90.0, 0.0).unwrap();
    let before = r.target_rpms();
    assert!(matches!(
        r.holonomic(f32::NAN, 90.0, 0.0),
        Err(RobotError::Command(_))
    ));
    assert!(matches!(
        r.non_holonomic(0.0, f32::INFINITY, 0.0),
        Err(RobotError::Command(_))
    ));
    assert_eq!(r.target_rpms(), before);
}

#[test]
fn test_gain_tuning() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.set_kp(25.0).unwrap();
    assert_eq!(r.kp(), 25.0);
    assert!(r.set_kp(-1.0).is_err());
    assert!(r.set_kp(f32::NAN).is_err());
    assert_eq!(r.kp(), 25.0);
}

#[test]
fn test_invalid_geometry_fails_construction() {
    let counters = blind_counters();
    let config = RobotConfig {
        geometry: RobotGeometry {
            wheel_diameter_m: -0.06,
            ..RobotGeometry::default()
        },
        ..RobotConfig::default()
    };
    let result = RobotController::new(
        &config,
        [fake_motor(), fake_motor(), fake_motor()],
        [&counters[0], &counters[1], &counters[2]],
        at_ms(0),
    );
    assert!(matches!(
        result,
        Err(RobotError::Config(ConfigError::Geometry(GeometryError::WheelDiameter)))
    ));
}

#[test]
fn test_tick_interval_beyond_timer_range_fails_construction() {
    let counters = blind_counters();
    let config = RobotConfig {
        min_tick_ms: 5_000_000,
        ..RobotConfig::default()
    };
    let result = RobotController::new(
        &config,
        [fake_motor(), fake_motor(), fake_motor()],
        [&counters[0], &counters[1], &counters[2]],
        at_ms(0),
    );
    assert!(matches!(result, Err(RobotError::Config(ConfigError::TickInterval))));
}

#[test]
fn test_reset_encoders_clears_baseline() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    pulse_all(&counters, 0, 100);
    r.update(at_ms(20)).unwrap();
    assert!(r.current_rpms().iter().all(|&rpm| rpm > 0.0));

    r.reset_encoders();
    assert!(counters.iter().all(|c| c.get_count() == 0));
    assert!(r.wheels().iter().all(|w| w.last_count == 0));

    r.update(at_ms(40)).unwrap();
    assert_eq!(r.current_rpms(), [0.0; 3]);
}

#[test]
fn test_counts_present_at_start_are_baseline() {
    let counters = blind_counters();
    pulse_all(&counters, 0, 7);
    let mut r = robot(10.0, &counters);
    r.update(at_ms(20)).unwrap();
    assert_eq!(r.current_rpms(), [0.0; 3]);
}

#[test]
fn test_telemetry_snapshot() {
    let counters = blind_counters();
    let mut r = robot(10.0, &counters);
    r.holonomic(0.1, 90.0, 0.0).unwrap();
    pulse_all(&counters, 5_000, 2);
    r.update(at_ms(20)).unwrap();

    let t = r.telemetry();
    assert_eq!(t.phase, DrivePhase::Running);
    for (i, w) in t.wheels.iter().enumerate() {
        assert_eq!(w.target_rpm, r.target_rpms()[i]);
        assert_eq!(w.last_count, 2);
    }
}

// --- failure propagation ---

#[derive(Debug, PartialEq)]
struct Fault(usize);

/// Fails every `stop` after the first `healthy_stops`, and every `drive` once
/// `rejects_drive` is set.
struct FlakyMotor {
    id: usize,
    healthy_stops: usize,
    stops: usize,
    drives: usize,
    rejects_drive: bool,
}

impl FlakyMotor {
    fn new(
        id: usize,
        healthy_stops: usize,
    ) -> Self {
        Self {
            id,
            healthy_stops,
            stops: 0,
            drives: 0,
            rejects_drive: false,
        }
    }

    fn rejecting_drive(mut self) -> Self {
        self.rejects_drive = true;
        self
    }
}

impl WheelDrive for FlakyMotor {
    type Error = Fault;

    fn drive(
        &mut self,
        _command: DriveCommand,
    ) -> Result<(), Self::Error> {
        if self.rejects_drive {
            return Err(Fault(self.id));
        }
        self.drives += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.stops += 1;
        if self.stops > self.healthy_stops {
            Err(Fault(self.id))
        } else {
            Ok(())
        }
    }

    fn max_duty(&self) -> u16 {
        MAX_DUTY
    }
}

#[test]
fn test_stop_attempts_every_motor() {
    let counters = blind_counters();
    let motors = [
        FlakyMotor::new(0, 1),
        FlakyMotor::new(1, usize::MAX),
        FlakyMotor::new(2, 1),
    ];
    let mut r = RobotController::new(
        &RobotConfig::default(),
        motors,
        [&counters[0], &counters[1], &counters[2]],
        at_ms(0),
    )
    .unwrap();

    r.holonomic(0.1, 90.0, 0.0).unwrap();
    assert!(matches!(r.stop(), Err(RobotError::Drive(Fault(0)))));
    assert!(r.motors().iter().all(|m| m.stops == 2));
    assert_eq!(r.target_rpms(), [0.0; 3]);
    assert_eq!(r.phase(), DrivePhase::Stopped);
}

#[test]
fn test_construction_propagates_motor_fault() {
    let counters = blind_counters();
    let result = RobotController::new(
        &RobotConfig::default(),
        [
            FlakyMotor::new(0, 1),
            FlakyMotor::new(1, 0),
            FlakyMotor::new(2, 1),
        ],
        [&counters[0], &counters[1], &counters[2]],
        at_ms(0),
    );
    assert!(matches!(result, Err(RobotError::Drive(Fault(1)))));
}

#[test]
fn test_rejected_drive_halts_every_motor() {
    let counters = blind_counters();
    let motors = [
        FlakyMotor::new(0, usize::MAX),
        FlakyMotor::new(1, usize::MAX).rejecting_drive(),
        FlakyMotor::new(2, usize::MAX),
    ];
    let mut r = RobotController::new(
        &RobotConfig::default(),
        motors,
        [&counters[0], &counters[1], &counters[2]],
        at_ms(0),
    )
    .unwrap();

    r.non_holonomic(0.0, -0.1, 0.0).unwrap();
    assert!(matches!(r.update(at_ms(20)), Err(RobotError::Drive(Fault(1)))));
    assert_eq!(r.drive_outputs(), [0.0; 3]);
    assert_eq!(r.target_rpms(), [0.0; 3]);
    assert_eq!(r.phase(), DrivePhase::Stopped);
    // construction stop plus the halt after the rejected drive
    assert!(r.motors().iter().all(|m| m.stops == 2));
    assert_eq!(r.motors()[0].drives, 1);
    assert_eq!(r.motors()[2].drives, 0);

    // a halted base is not driven again until a new command arrives
    let outcome = r.update(at_ms(40)).unwrap();
    assert!(matches!(outcome, Tick::Applied { driven: false, .. }));
}
