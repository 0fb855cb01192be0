use std::sync::{Arc, Mutex};

use futures::{StreamExt, stream};
use htbucket::futures::{SharedHierarchy, ShapedStreamExt};
use htbucket::{ClassLimit, Hierarchy, TokioClock};
use nonzero_ext::nonzero;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
struct Frame {
    seq: usize,
    len: u32,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // a 2000 bytes per second uplink, guaranteeing 1500 to video and 500 to
    // chat; either may take up the other's slack
    let mut htb = Hierarchy::new();
    let uplink = htb
        .add_root("uplink", ClassLimit::new(2000.0, 2000.0).unwrap())
        .unwrap();
    let video = htb
        .add_child(uplink, "video", ClassLimit::new(1500.0, 2000.0).unwrap())
        .unwrap();
    let chat = htb
        .add_child(uplink, "chat", ClassLimit::new(500.0, 2000.0).unwrap())
        .unwrap();
    let htb: SharedHierarchy = Arc::new(Mutex::new(htb));
    let clock = TokioClock::default();

    let start = tokio::time::Instant::now();
    let mut handles = JoinSet::new();
    for (name, class, len) in [("video", video, 600), ("chat", chat, 120)] {
        let frames = stream::iter((0..20).map(move |seq| Frame { seq, len }));
        let shaped = frames.shape(Arc::clone(&htb), class, clock.clone(), |f: &Frame| {
            std::num::NonZeroU32::new(f.len).unwrap_or(nonzero!(1u32))
        });
        handles.spawn(async move {
            let mut shaped = std::pin::pin!(shaped);
            while let Some(frame) = shaped.next().await {
                println!(
                    "[{name}] frame {} ({} bytes), elapsed={:?}",
                    frame.seq,
                    frame.len,
                    start.elapsed()
                );
            }
        });
    }

    handles.join_all().await;
    println!("Completed in {:?}", start.elapsed());
    for class in htb.lock().unwrap().snapshot() {
        println!(
            "{}: {:.0} tokens, {:.0} ctokens, {:?}",
            class.name, class.tokens, class.ctokens, class.state
        );
    }
}
