//! Virtual-mode smoke demo.
//!
//! Stands in for a host application: initializes the shim in Virtual mode,
//! fills every buffer switch with a 440 Hz sine, and prints pipeline stats
//! once a second. On Windows the tone plays on the default endpoint; on
//! other platforms the producer side still runs and the stats show it.
//!
//! Run with: cargo run --example virtual_loopback

use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopcast::{output_devices, AsioDriver, BufferInfo, CastDriver, DriverCallbacks, ShimConfig};

const BLOCK: usize = 256;
const TONE_HZ: f64 = 440.0;

fn main() {
    env_logger::init();

    for device in output_devices() {
        println!("endpoint: {} ({})", device.name, device.id);
    }

    let mut driver = CastDriver::with_config(ShimConfig::default());
    assert!(driver.init(0), "driver init failed");

    let rate = driver.sample_rate().expect("sample rate");
    println!(
        "{} v{} at {rate} Hz, block {BLOCK}",
        driver.driver_name(),
        driver.driver_version()
    );

    // Half addresses are known only after create_buffers fills the infos,
    // so the callback reads them through a shared slot.
    let halves: Arc<Mutex<Vec<[usize; 2]>>> = Arc::new(Mutex::new(Vec::new()));
    let phase = Arc::new(Mutex::new(0.0f64));

    let writer_halves = halves.clone();
    let callbacks = DriverCallbacks {
        buffer_switch: Some(Box::new(move |index, _direct| {
            let halves = writer_halves.lock().unwrap();
            if halves.is_empty() {
                return;
            }
            let mut phase = phase.lock().unwrap();
            let step = 2.0 * std::f64::consts::PI * TONE_HZ / rate;
            for channel in halves.iter() {
                let samples = channel[index as usize] as *mut f32;
                for i in 0..BLOCK {
                    let value = ((*phase + i as f64 * step).sin() * 0.2) as f32;
                    unsafe { samples.add(i).write(value) };
                }
            }
            *phase = (*phase + BLOCK as f64 * step) % (2.0 * std::f64::consts::PI);
        })),
        ..Default::default()
    };

    let mut infos = vec![BufferInfo::output(0), BufferInfo::output(1)];
    driver
        .create_buffers(&mut infos, BLOCK as u32, callbacks)
        .expect("create_buffers");
    *halves.lock().unwrap() = infos
        .iter()
        .map(|info| [info.buffers[0] as usize, info.buffers[1] as usize])
        .collect();

    driver.start().expect("start");
    for _ in 0..5 {
        std::thread::sleep(Duration::from_secs(1));
        let stats = driver.stats();
        println!(
            "blocks {} (dropped {}), frames rendered {}, underruns {}",
            stats.blocks_produced, stats.blocks_dropped, stats.frames_rendered, stats.underruns
        );
    }
    driver.stop().expect("stop");
    driver.dispose_buffers().expect("dispose_buffers");
}
