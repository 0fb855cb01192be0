use htbucket::{
    ClassLimit, CountingSink, Hierarchy, PacketSink, PacketSource, Paced, Scheduler,
    SchedulerConfig,
};
use nonzero_ext::nonzero;
use tracing_subscriber::EnvFilter;

const UNTIL: f64 = 10_000.0;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut htb = Hierarchy::new();
    let root = htb
        .add_root("root", ClassLimit::new(800.0, 800.0).unwrap())
        .unwrap();
    let mut scheduler =
        Scheduler::new(htb, SchedulerConfig::default().with_seed(2014)).unwrap();

    // each flow offers 1000 bytes per second
    let offered = || Paced::new(nonzero!(100u32), 0.0, 0.1);

    let mut sinks = Vec::new();
    for (name, rate) in [("S1", 300.0), ("S2", 500.0)] {
        let sink = CountingSink::new();
        sinks.push((name, sink.counters()));
        scheduler
            .add_shaper(
                Some(root),
                name,
                ClassLimit::new(rate, 800.0).unwrap(),
                offered(),
                sink,
            )
            .unwrap();
    }

    // an unshaped flow for comparison
    let mut unshaped = CountingSink::new();
    let mut source = offered().until(UNTIL);
    while let Some(packet) = source.next_packet(UNTIL) {
        unshaped.deliver(packet, packet.created_at());
    }

    let report = scheduler.simulate(UNTIL);
    let counters = unshaped.counters();
    println!(
        "[unshaped: {} bytes in {:.1} seconds ({:.1}Bps)",
        counters.bytes(),
        counters.last_arrival(),
        counters.rate()
    );
    for (name, counters) in &sinks {
        println!(
            "[{name}: {} bytes in {:.1} seconds ({:.1}Bps)",
            counters.bytes(),
            counters.last_arrival(),
            counters.rate()
        );
    }
    println!(
        "{} packets sent on guaranteed rate, {} borrowed",
        report.packets_guaranteed, report.packets_borrowed
    );
    for stats in scheduler.stats() {
        println!("{stats}");
    }
}
