use proptest::prelude::*;

use sandbox_agent::context::{
    prune_suffix, Content, ContentPart, ConversationContext, ImageUrl, Message, Role, WindowLimits,
};

fn entry(kind: u8, idx: usize) -> Message {
    match kind % 3 {
        0 => Message::screenshot(format!("data:image/png;base64,{idx}")),
        1 => Message::assistant(format!("Thought: step {idx}\nAction: wait()")),
        _ => Message {
            role: Role::User,
            content: Content::Parts(vec![
                ContentPart::Text { text: format!("note {idx}") },
                ContentPart::ImageUrl { image_url: ImageUrl { url: format!("img-{idx}") } },
            ]),
        },
    }
}

fn suffix_strategy() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(any::<u8>(), 0..60)
        .prop_map(|kinds| kinds.into_iter().enumerate().map(|(i, k)| entry(k, i)).collect())
}

fn limits_strategy() -> impl Strategy<Value = WindowLimits> {
    (1usize..8, 1usize..25).prop_map(|(max_images, max_messages)| WindowLimits { max_images, max_messages })
}

fn is_subsequence(needle: &[Message], hay: &[Message]) -> bool {
    let mut it = hay.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}

fn framed(limits: WindowLimits, memories: &[String]) -> ConversationContext {
    let mut ctx = ConversationContext::new(limits);
    ctx.setup_prompt("You are a GUI agent.", Some("Be brief."), memories, "open the settings page");
    ctx
}

proptest! {
    #[test]
    fn pruned_suffix_respects_both_budgets(suffix in suffix_strategy(), limits in limits_strategy()) {
        let kept = prune_suffix(&suffix, limits);

        let images: usize = kept.iter().map(Message::image_count).sum();
        let units: usize = kept.iter().filter(|m| m.image_count() == 0).map(Message::text_units).sum();
        prop_assert!(images <= limits.max_images);
        prop_assert!(units <= limits.max_messages);
        prop_assert!(is_subsequence(&kept, &suffix));
        if let Some(newest) = suffix.last() {
            prop_assert_eq!(kept.last(), Some(newest));
        }
    }

    #[test]
    fn prune_never_touches_the_prefix(
        suffix in suffix_strategy(),
        limits in limits_strategy(),
        memories in prop::collection::vec("[a-z ]{1,12}", 0..3),
    ) {
        let mut ctx = framed(limits, &memories);
        let prefix = ctx.messages();
        for m in suffix {
            ctx.push(m);
        }
        ctx.prune();

        let all = ctx.messages();
        prop_assert_eq!(ctx.prefix_len(), prefix.len());
        prop_assert_eq!(&all[..prefix.len()], &prefix[..]);
        prop_assert_eq!(&all[prefix.len()..], ctx.history());
    }

    #[test]
    fn persisted_context_restores_to_the_same_sequence(
        suffix in suffix_strategy(),
        limits in limits_strategy(),
        pin in any::<bool>(),
    ) {
        let mut ctx = framed(limits, &[]);
        for m in suffix {
            ctx.push(m);
        }
        ctx.prune();
        if pin {
            ctx.push_assistant("Action: output(content='pinned')");
            ctx.capture_output();
        }

        let persisted = ctx.to_persisted();
        prop_assert!(persisted.iter().all(|m| m.image_count() == 0));

        let restored = ConversationContext::restore(persisted.clone(), limits);
        prop_assert_eq!(restored.messages(), persisted);
        prop_assert_eq!(restored.prefix_len(), ctx.prefix_len());
        prop_assert!(restored.sticky().is_empty());
    }
}
