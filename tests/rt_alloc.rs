use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use strata::nodes::{AudioInputNode, AudioOutputNode, MidiInputNode, NoteSequencer, SequencedNote, SineSynth};
use strata::{ControlMsg, Engine, EngineConfig, HostContext, MidiMessage};

thread_local! {
    static ALLOC_COUNT: Cell<usize> = const { Cell::new(0) };
}

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _ = ALLOC_COUNT.try_with(|c| c.set(c.get() + 1));
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static A: CountingAllocator = CountingAllocator;

fn allocations() -> usize {
    ALLOC_COUNT.with(Cell::get)
}

#[test]
fn process_does_not_allocate_after_start() {
    let config = EngineConfig {
        block_size: 128,
        ..EngineConfig::default()
    };
    let (mut callback, controller) = Engine::new(HostContext::new(config).unwrap()).unwrap();
    let (midi_in, mut device_midi) = MidiInputNode::new(256);
    let synth = controller.edit_graph(|graph| {
        let audio_in = graph.add_node(AudioInputNode::new(2));
        let keys = graph.add_node(midi_in);
        let seq = graph.add_node(NoteSequencer::new(
            (0..16)
                .map(|i| SequencedNote {
                    start: i * 120,
                    length: 90,
                    channel: 0,
                    pitch: 48 + i as u8,
                    velocity: 100,
                })
                .collect(),
        ));
        let synth = graph.add_node(SineSynth::new());
        let out = graph.add_node(AudioOutputNode::new(2));
        graph.connect_midi(keys, synth, 0, 0).unwrap();
        graph.connect_midi(seq, synth, 0, 0).unwrap();
        graph.connect_audio(synth, out, 0, 0, 2).unwrap();
        graph.connect_audio(audio_in, out, 0, 0, 2).unwrap();
        synth
    });
    controller.start_processing();
    let transporter = controller.transporter().clone();
    transporter.set_loop_range(0, 48_000);
    transporter.set_loop_enabled(true);
    transporter.set_playing(true);

    let input_l = vec![0.1f32; 128];
    let input_r = vec![-0.1f32; 128];
    let mut out_l = vec![0.0f32; 128];
    let mut out_r = vec![0.0f32; 128];
    let input: [&[f32]; 2] = [&input_l, &input_r];

    // Warm up: first touches of lazily initialized state.
    for _ in 0..4 {
        let mut output: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
        callback.process(&input, &mut output, 128);
    }

    let before = allocations();
    for block in 0..2_000 {
        if block % 50 == 0 {
            let _ = device_midi.push(MidiMessage::note_on(3, 1, 72, 100));
            let _ = controller.send(ControlMsg::SetGain { node: synth, gain: 0.8 });
        }
        if block % 50 == 25 {
            let _ = device_midi.push(MidiMessage::note_off(7, 1, 72));
            let _ = controller.send(ControlMsg::AllNotesOff);
        }
        let mut output: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
        callback.process(&input, &mut output, 128);
    }
    let after = allocations();

    assert_eq!(after, before, "AudioCallback::process must not allocate");
    assert!(out_l.iter().any(|&s| s != 0.0));
}
