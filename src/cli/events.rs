//! `events` command implementation.

use clap::{Args, ValueEnum};
use std::time::Duration;
use vboxctl::events::Event;
use vboxctl::ops;
use vboxctl::Result;
use vboxctl_protocol::EventType;

use super::Context;

/// Event categories selectable on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Any,
    Machine,
    State,
    Data,
    Registered,
    Session,
    Property,
}

impl From<Category> for EventType {
    fn from(c: Category) -> Self {
        match c {
            Category::Any => EventType::Any,
            Category::Machine => EventType::MachineEvent,
            Category::State => EventType::MachineStateChanged,
            Category::Data => EventType::MachineDataChanged,
            Category::Registered => EventType::MachineRegistered,
            Category::Session => EventType::SessionStateChanged,
            Category::Property => EventType::GuestPropertyChanged,
        }
    }
}

/// Print platform events as they arrive.
#[derive(Args, Debug)]
pub struct EventsCmd {
    /// How long to listen.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Categories to subscribe to.
    #[arg(long = "category", value_enum, default_values_t = [Category::Any])]
    pub categories: Vec<Category>,
}

impl EventsCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let categories: Vec<EventType> = self.categories.iter().copied().map(EventType::from).collect();

        ctx.with_session(|session| {
            println!(
                "Listening for {} of events...",
                humantime::format_duration(self.duration)
            );
            let slice = ctx.config.event_poll();
            let handled = ops::watch_events_sliced(session, &categories, self.duration, slice, |event| {
                println!("{}", format_event(event));
                Ok(())
            })?;
            println!("{} event(s) received", handled);
            Ok(())
        })
    }
}

pub fn format_event(event: &Event) -> String {
    if event.payload().is_null() {
        event.type_tag().to_string()
    } else {
        format!("{} {}", event.type_tag(), event.payload())
    }
}
