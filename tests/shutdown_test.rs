//! Runtime shutdown. Kept in its own test binary: shutdown is process-wide and final.

use std::sync::Arc;

use genai_oxidized::device::DeviceType;
use genai_oxidized::{runtime, DemoEngineFactory, GenError, Generator, GeneratorParams, Model, ModelConfig};

#[test]
fn shutdown_terminates_every_session() {
    let model = Arc::new(Model::new(ModelConfig::decoder(32, 32), DemoEngineFactory::seeded(1)).unwrap());
    let params = Arc::new(GeneratorParams::new(&model));
    let mut gen = Generator::new(Arc::clone(&model), Arc::clone(&params)).unwrap();
    gen.append_tokens(&[1, 3]).unwrap();
    gen.generate_next_token().unwrap();

    runtime::shutdown();
    assert!(runtime::is_shut_down());
    assert!(gen.is_session_terminated());
    assert!(matches!(gen.generate_next_token(), Err(GenError::SessionTerminated)));
    assert!(matches!(
        Generator::new(Arc::clone(&model), params),
        Err(GenError::SessionTerminated)
    ));
    assert!(matches!(runtime::device(DeviceType::Cpu), Err(GenError::SessionTerminated)));
    assert!(matches!(runtime::globals(), Err(GenError::SessionTerminated)));
}
