//! Interface between input device adapters and the rest of the server.
//!
//! A platform decoder implements `InputSource`, turning whatever its
//! descriptor produces into `DeviceEvent`s. Wrapping it into an `InputDevice`
//! gives a `Dispatchable` that can be registered into a `Multiplexer`: every
//! time the descriptor becomes readable, pending events are converted into
//! `InputEvent`s and delivered to the `InputSink` the device has been started
//! with.

use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, trace};

use crate::{
    dispatch::{Dispatchable, FdEvents},
    report::{self, Report},
    Point,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Motion,
    Up,
}

/// Event as decoded from the device, before the pointer state of the device
/// is applied to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceEvent {
    Key {
        time: Duration,
        scan_code: u32,
        state: ButtonState,
    },
    /// Motion of a relative device such as a mouse.
    RelativeMotion { time: Duration, dx: f32, dy: f32 },
    /// Motion of an absolute device such as a tablet, already scaled to
    /// output coordinates.
    AbsoluteMotion { time: Duration, position: Point },
    Button {
        time: Duration,
        button: u32,
        state: ButtonState,
    },
    Axis {
        time: Duration,
        horizontal: f32,
        vertical: f32,
    },
    Touch {
        time: Duration,
        id: i32,
        action: TouchAction,
        position: Point,
    },
}

/// Input event delivered to an `InputSink`. Pointer events carry the pointer
/// position after the event has been applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Key {
        time: Duration,
        scan_code: u32,
        state: ButtonState,
    },
    PointerMotion {
        time: Duration,
        position: Point,
        dx: f32,
        dy: f32,
    },
    PointerButton {
        time: Duration,
        button: u32,
        state: ButtonState,
        position: Point,
    },
    PointerAxis {
        time: Duration,
        horizontal: f32,
        vertical: f32,
        position: Point,
    },
    Touch {
        time: Duration,
        id: i32,
        action: TouchAction,
        position: Point,
    },
}

impl InputEvent {
    pub fn time(&self) -> Duration {
        match *self {
            InputEvent::Key { time, .. }
            | InputEvent::PointerMotion { time, .. }
            | InputEvent::PointerButton { time, .. }
            | InputEvent::PointerAxis { time, .. }
            | InputEvent::Touch { time, .. } => time,
        }
    }
}

/// Receiver of the events of input devices.
pub trait InputSink: Send + Sync {
    fn handle_input(&self, event: &InputEvent);

    /// Restrict `position` to the area the pointer is allowed to move into.
    fn confine_pointer(&self, position: &mut Point);
}

/// Platform decoder of an input device.
pub trait InputSource: Send + 'static {
    /// Descriptor that becomes readable when events are pending.
    fn as_fd(&self) -> BorrowedFd<'_>;

    /// Decode all pending events and append them to `events`.
    fn read_events(&mut self, events: &mut Vec<DeviceEvent>) -> anyhow::Result<()>;
}

/// Converts a device event into an input event, updating the pointer
/// position of the device.
fn convert_event(
    event: DeviceEvent,
    pointer_position: &mut Point,
    sink: &dyn InputSink,
) -> InputEvent {
    match event {
        DeviceEvent::Key {
            time,
            scan_code,
            state,
        } => InputEvent::Key {
            time,
            scan_code,
            state,
        },
        DeviceEvent::RelativeMotion { time, dx, dy } => {
            let mut position = Point::new(pointer_position.x + dx, pointer_position.y + dy);
            sink.confine_pointer(&mut position);
            *pointer_position = position;
            InputEvent::PointerMotion {
                time,
                position,
                dx,
                dy,
            }
        }
        DeviceEvent::AbsoluteMotion { time, position } => {
            let mut position = position;
            let dx = position.x - pointer_position.x;
            let dy = position.y - pointer_position.y;
            sink.confine_pointer(&mut position);
            *pointer_position = position;
            InputEvent::PointerMotion {
                time,
                position,
                dx,
                dy,
            }
        }
        DeviceEvent::Button {
            time,
            button,
            state,
        } => InputEvent::PointerButton {
            time,
            button,
            state,
            position: *pointer_position,
        },
        DeviceEvent::Axis {
            time,
            horizontal,
            vertical,
        } => InputEvent::PointerAxis {
            time,
            horizontal,
            vertical,
            position: *pointer_position,
        },
        DeviceEvent::Touch {
            time,
            id,
            action,
            position,
        } => InputEvent::Touch {
            time,
            id,
            action,
            position,
        },
    }
}

struct DeviceState<S: InputSource> {
    source: S,
    sink: Option<Arc<dyn InputSink>>,
    pointer_position: Point,
    /// Reused between dispatches.
    events: Vec<DeviceEvent>,
}

/// `Dispatchable` feeding the events of an `InputSource` to an `InputSink`.
///
/// Until `start()` is called, events are read from the source and discarded.
pub struct InputDevice<S: InputSource> {
    fd: OwnedFd,
    state: Mutex<DeviceState<S>>,
    report: Arc<dyn Report>,
}

impl<S: InputSource> InputDevice<S> {
    pub fn new(source: S) -> io::Result<Self> {
        Self::with_report(source, report::default_report())
    }

    pub fn with_report(source: S, report: Arc<dyn Report>) -> io::Result<Self> {
        // Keep our own reference to the descriptor so we can hand it out
        // without locking the source.
        let fd = source.as_fd().try_clone_to_owned()?;

        Ok(InputDevice {
            fd,
            state: Mutex::new(DeviceState {
                source,
                sink: None,
                pointer_position: Point::default(),
                events: Vec::new(),
            }),
            report,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start delivering events to `sink`.
    pub fn start(&self, sink: Arc<dyn InputSink>) {
        debug!("Input device {} started", self.fd.as_raw_fd());
        self.lock_state().sink = Some(sink);
    }

    /// Stop delivering events. Pending and future events are discarded.
    pub fn stop(&self) {
        debug!("Input device {} stopped", self.fd.as_raw_fd());
        self.lock_state().sink = None;
    }

    pub fn pointer_position(&self) -> Point {
        self.lock_state().pointer_position
    }

    fn process_events(&self) -> anyhow::Result<()> {
        let (mut events, sink, mut pointer_position) = {
            let mut state = self.lock_state();
            let mut events = std::mem::take(&mut state.events);
            events.clear();
            state.source.read_events(&mut events)?;
            (events, state.sink.clone(), state.pointer_position)
        };

        // Deliver without holding the lock, so the sink can stop the device.
        match &sink {
            Some(sink) => {
                for event in events.drain(..) {
                    let event = convert_event(event, &mut pointer_position, sink.as_ref());
                    trace!("Input event {:?}", event);
                    sink.handle_input(&event);
                }
            }
            None => {
                trace!("Discarding {} input events", events.len());
                events.clear();
            }
        }

        let mut state = self.lock_state();
        state.pointer_position = pointer_position;
        state.events = events;

        Ok(())
    }
}

impl<S: InputSource> Dispatchable for InputDevice<S> {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE | FdEvents::REMOTE_CLOSED
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        if events.contains(FdEvents::ERROR) {
            return false;
        }

        if events.contains(FdEvents::READABLE) {
            if let Err(e) = self.process_events() {
                self.report.input_error(self.fd.as_raw_fd(), &e);
                return false;
            }
        }

        // The device is gone once everything it had to say has been read.
        !events.contains(FdEvents::REMOTE_CLOSED)
    }
}
