//! Full-stack rig: an archetype drives a counter replica and an output
//! channel through the scheduler, mirroring how compiled test rigs
//! exercise a resource.

use tandem_core::Value;
use tandem_resources::{output_channel, GCounter, GCounterConfig};
use tandem_runtime::{
    Archetype, ArchetypeContext, ArchetypeInterface, CriticalSection, JumpTable, ProcTable,
    SectionFuture,
};

fn rig_loop_body(iface: &mut ArchetypeInterface) -> SectionFuture<'_> {
    Box::pin(async move {
        let i = iface.require_resource("ARig.i")?;
        let iter_count = iface.require_resource("ARig.iterCount")?;
        let crdt = iface.require_resource_ref("ARig.crdt")?;
        let counting_ch = iface.require_resource_ref("ARig.countingCh")?;

        let current = iface.read(i, &[]).await?;
        let bound = iface.read(iter_count, &[]).await?;
        if current.as_number()? < bound.as_number()? {
            let next = current.add(&Value::number(1))?;
            iface.write(i, &[], next.clone()).await?;
            // own slot grows with every iteration
            iface.write(crdt, &[], next).await?;
            let observed = iface.read(crdt, &[]).await?;
            iface.write(counting_ch, &[], observed).await?;
            iface.goto("ARig.loop")
        } else {
            iface.goto("ARig.finish")
        }
    })
}

fn rig_finish_body(iface: &mut ArchetypeInterface) -> SectionFuture<'_> {
    Box::pin(async move {
        let crdt = iface.require_resource_ref("ARig.crdt")?;
        let counting_ch = iface.require_resource_ref("ARig.countingCh")?;
        let final_value = iface.read(crdt, &[]).await?;
        iface.write(counting_ch, &[], final_value).await?;
        iface.goto("ARig.Done")
    })
}

fn rig_done_body(iface: &mut ArchetypeInterface) -> SectionFuture<'_> {
    Box::pin(async move { iface.done() })
}

fn rig_preamble(iface: &mut ArchetypeInterface) -> SectionFuture<'_> {
    Box::pin(async move {
        iface.ensure_resource_local("ARig.i", Value::number(0));
        Ok(())
    })
}

fn rig() -> Archetype {
    Archetype {
        name: "ARig",
        initial_label: "ARig.loop",
        required_ref_params: &["ARig.crdt", "ARig.countingCh"],
        required_val_params: &["ARig.iterCount"],
        jump_table: JumpTable::new([
            CriticalSection {
                name: "ARig.loop",
                body: rig_loop_body,
            },
            CriticalSection {
                name: "ARig.finish",
                body: rig_finish_body,
            },
            CriticalSection {
                name: "ARig.Done",
                body: rig_done_body,
            },
        ]),
        proc_table: ProcTable::empty(),
        preamble: Some(rig_preamble),
    }
}

#[tokio::test]
async fn archetype_drives_a_counter_through_the_scheduler() {
    let id = Value::number(1);
    let counter = GCounter::start(
        id.clone(),
        vec![],
        |_| "127.0.0.1:0".to_string(),
        GCounterConfig::default(),
    )
    .await
    .unwrap();
    let (out, mut observed) = output_channel(64);

    let mut ctx = ArchetypeContext::builder(rig(), id)
        .bind_ref_param("ARig.crdt", counter)
        .bind_ref_param("ARig.countingCh", out)
        .bind_value_param("ARig.iterCount", Value::number(10))
        .finish()
        .await
        .unwrap();

    ctx.run().await.unwrap();
    ctx.close().await;

    // ten committed iterations, each observing its own write, then the
    // final read from the finish section
    let mut seen = Vec::new();
    while let Ok(v) = observed.try_recv() {
        seen.push(v.as_number().unwrap());
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 10]);
}
