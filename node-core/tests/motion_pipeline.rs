use std::cell::RefCell;
use std::collections::VecDeque;

use node_core::config::{CHANNEL_DEPTH, Timing};
use node_core::debounce::{Debouncer, EdgeOutcome, MotionEvent, MotionInput};
use node_core::fabric::{EnqueueError, EventProducer};
use node_core::indicator::{
    ChannelId, Color, IndicatorCell, IndicatorState, PixelDriver, PixelError, Renderer, Rgb,
};
use node_core::motion::MotionLight;

struct Queue {
    items: RefCell<VecDeque<MotionEvent>>,
    depth: usize,
}

impl Queue {
    fn new(depth: usize) -> Self {
        Self {
            items: RefCell::new(VecDeque::new()),
            depth,
        }
    }

    fn pop(&self) -> Option<MotionEvent> {
        self.items.borrow_mut().pop_front()
    }
}

impl EventProducer<MotionEvent> for &Queue {
    fn try_enqueue(&self, item: MotionEvent) -> Result<(), EnqueueError<MotionEvent>> {
        let mut items = self.items.borrow_mut();
        if items.len() >= self.depth {
            return Err(EnqueueError::Full(item));
        }
        items.push_back(item);
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.depth)
    }
}

#[derive(Default)]
struct Led {
    channels: [u16; 3],
    shown: Rgb,
}

impl PixelDriver for Led {
    fn set_channel(&mut self, channel: ChannelId, intensity: u16) -> Result<(), PixelError> {
        let index = match channel {
            ChannelId::Red => 0,
            ChannelId::Green => 1,
            ChannelId::Blue => 2,
        };
        self.channels[index] = intensity;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PixelError> {
        self.shown = Rgb::new(self.channels[0], self.channels[1], self.channels[2]);
        Ok(())
    }
}

#[test]
fn pulse_inside_window_emits_only_first_event() {
    let queue = Queue::new(CHANNEL_DEPTH);
    let input = MotionInput::new(Debouncer::new(1_000), &queue);

    assert_eq!(
        input.on_edge(0),
        EdgeOutcome::Enqueued(MotionEvent { timestamp: 0 })
    );
    assert_eq!(input.on_edge(500), EdgeOutcome::Suppressed);

    assert_eq!(queue.pop(), Some(MotionEvent { timestamp: 0 }));
    assert_eq!(queue.pop(), None);
    assert_eq!(input.suppressed(), 1);
}

#[test]
fn full_channel_counts_lost_events_without_blocking() {
    let queue = Queue::new(2);
    let input = MotionInput::new(Debouncer::new(1_000), &queue);

    for second in 0..4 {
        input.on_edge(second * 1_000);
    }

    assert_eq!(input.lost(), 2);
    assert_eq!(queue.pop(), Some(MotionEvent { timestamp: 0 }));
    assert_eq!(queue.pop(), Some(MotionEvent { timestamp: 1_000 }));
    assert_eq!(queue.pop(), None);
}

#[test]
fn motion_lights_indicator_then_settles_off() {
    let queue = Queue::new(CHANNEL_DEPTH);
    let input = MotionInput::new(Debouncer::new(1_000), &queue);
    let cell = IndicatorCell::new(IndicatorState::Off);
    let mut light = MotionLight::new(Color::White, &Timing::default());
    let mut renderer = Renderer::new();
    let mut led = Led::default();

    input.on_edge(100);
    let event = queue.pop().expect("event enqueued");
    cell.set_state(light.on_motion(event));

    renderer
        .step(cell.current())
        .apply(&mut led)
        .expect("pixel write");
    assert_eq!(led.shown, Color::White.full());

    let off = light.poll(1_100).expect("hold expired");
    cell.set_state(off);
    renderer
        .step(cell.current())
        .apply(&mut led)
        .expect("pixel write");
    assert_eq!(led.shown, Rgb::OFF);
}

#[test]
fn last_state_wins_across_interrupted_animations() {
    let cell = IndicatorCell::new(IndicatorState::Off);
    let mut renderer = Renderer::new();
    let mut led = Led::default();

    let sequence = [
        IndicatorState::Pulsating(Color::Blue),
        IndicatorState::Flashing(Color::Red),
        IndicatorState::Pulsating(Color::Green),
        IndicatorState::Solid(Color::Green),
    ];
    for (index, state) in sequence.into_iter().enumerate() {
        cell.set_state(state);
        for _ in 0..=index * 3 {
            renderer
                .step(cell.current())
                .apply(&mut led)
                .expect("pixel write");
        }
    }

    assert_eq!(renderer.applied(), Some(IndicatorState::Solid(Color::Green)));
    assert_eq!(led.shown, Color::Green.full());
}
