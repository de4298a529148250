use proptest::prelude::*;
use strata::error::ProcessError;
use strata::nodes::{AudioInputNode, AudioOutputNode, SineSynth};
use strata::processor::{BusDirection, ProcessInfo, Processor};
use strata::{BlockOutcome, Engine, EngineConfig, HostContext};

/// Misbehaves on a fixed schedule: panics every `panic_every` calls and
/// fails every `fail_every` calls.
struct Chaos {
    calls: u32,
    panic_every: u32,
    fail_every: u32,
}

impl Processor for Chaos {
    fn name(&self) -> &str {
        "chaos"
    }

    fn audio_channel_count(&self, _direction: BusDirection) -> usize {
        2
    }

    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        self.calls += 1;
        if self.calls % self.panic_every == 0 {
            panic!("scheduled panic");
        }
        if self.calls % self.fail_every == 0 {
            info.audio_out.channel_mut(0).fill(f32::NAN);
            return Err(ProcessError::Failed("scheduled failure"));
        }
        for ch in 0..2 {
            info.audio_out.channel_mut(ch).copy_from_slice(info.audio_in.channel(ch));
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn callback_never_unwinds_and_never_emits_garbage(
        block_size in 1usize..256,
        device_inputs in 0usize..4,
        device_outputs in 0usize..4,
        blocks in prop::collection::vec((0usize..600, 0usize..600), 1..24),
        panic_every in 3u32..20,
        fail_every in 2u32..7,
        playing in any::<bool>(),
    ) {
        let config = EngineConfig {
            block_size,
            input_channels: 2,
            output_channels: 2,
            ..EngineConfig::default()
        };
        let (mut callback, controller) = Engine::new(HostContext::new(config).unwrap()).unwrap();
        controller.edit_graph(|graph| {
            let input = graph.add_node(AudioInputNode::new(2));
            let chaos = graph.add_node(Chaos { calls: 0, panic_every, fail_every });
            let synth = graph.add_node(SineSynth::new());
            let out = graph.add_node(AudioOutputNode::new(2));
            graph.connect_audio(input, chaos, 0, 0, 2).unwrap();
            graph.connect_audio(chaos, out, 0, 0, 2).unwrap();
            graph.connect_audio(synth, out, 0, 0, 2).unwrap();
        });
        controller.start_processing();
        controller.transporter().set_playing(playing);

        for (frames, buffer_len) in blocks {
            let inputs: Vec<Vec<f32>> = (0..device_inputs).map(|_| vec![0.25; buffer_len]).collect();
            let input_refs: Vec<&[f32]> = inputs.iter().map(Vec::as_slice).collect();
            let mut outputs: Vec<Vec<f32>> = (0..device_outputs).map(|_| vec![9.0; buffer_len]).collect();
            let outcome = {
                let mut output_refs: Vec<&mut [f32]> = outputs.iter_mut().map(Vec::as_mut_slice).collect();
                callback.process(&input_refs, &mut output_refs, frames)
            };

            let written = frames.min(buffer_len);
            match outcome {
                BlockOutcome::Processed { frames: done } => {
                    prop_assert_eq!(done, frames);
                    for channel in &outputs {
                        prop_assert!(channel[..written].iter().all(|s| s.is_finite() && s.abs() <= 1.0));
                    }
                }
                BlockOutcome::Failed => {
                    for channel in &outputs {
                        prop_assert!(channel[..written].iter().all(|&s| s == 0.0));
                    }
                }
                BlockOutcome::Skipped => prop_assert!(false, "nothing held the graph"),
            }
        }
        prop_assert_eq!(controller.inspect_graph(|g| g.node_count()), 4);
    }
}
