use crossterm::event::Event;
use std::io::{BufWriter, Stdout};

pub mod astro;

pub trait Effect {
    fn new(width: usize, height: usize) -> Self
    where
        Self: Sized;
    fn update(&mut self, dt: f32);
    fn render(&mut self, stdout: &mut BufWriter<Stdout>) -> std::io::Result<()>;
    fn resize(&mut self, width: usize, height: usize);
    fn handle_event(&mut self, _event: &Event) {}
}
