use super::Effect;
use std::collections::VecDeque;
use std::io::{BufWriter, Stdout, Write};

// The scene runs in virtual pixel space; each half-block cell covers a
// CELL_PX x CELL_PX square. Star density, streak speeds and cull margins
// are all pixel-denominated, so they stay independent of terminal geometry.
const CELL_PX: f32 = 16.0;

// One star per this many square pixels of sky.
const PIXELS_PER_STAR: f32 = 120_000.0;

const MAX_SHOOTING: usize = 4;

// Streaks are culled once they cross this far past a trailing screen edge.
const OFFSCREEN_MARGIN: f32 = 200.0;

struct Star {
    x: f32,
    y: f32,
    r: f32,
    blink: f32,
    speed: f32,
}

impl Star {
    // Pulses between 0.35 and 1.0 with period pi in the blink phase
    fn alpha(&self) -> f32 {
        0.35 + 0.65 * (0.5 + 0.5 * (self.blink * 2.0).sin())
    }
}

#[derive(Clone, PartialEq, Debug)]
struct ShootingStar {
    x: f32,
    y: f32,
    dx: f32,
    dy: f32,
    len: f32,
    speed: f32,
    life: f32,
    ttl: f32,
}

struct Scene {
    width: f32,
    height: f32,
    rng: fastrand::Rng,
    stars: Vec<Star>,
    shooting: VecDeque<ShootingStar>,
    time: f32,
    next_wave: f32,
    pending: Vec<f32>, // scene times of spawns committed by a triggered wave
}

impl Scene {
    fn new(width: f32, height: f32, mut rng: fastrand::Rng) -> Self {
        let count = (width * height / PIXELS_PER_STAR).round() as usize;
        let stars = (0..count)
            .map(|_| Star {
                x: rng.f32() * width,
                y: rng.f32() * height,
                r: 0.4 + rng.f32() * 1.3,
                blink: rng.f32() * std::f32::consts::TAU,
                speed: 0.6 + rng.f32() * 1.6,
            })
            .collect();

        let next_wave = 5.0 + rng.f32() * 5.0;

        Self {
            width,
            height,
            rng,
            stars,
            shooting: VecDeque::new(),
            time: 0.0,
            next_wave,
            pending: Vec::new(),
        }
    }

    // The star field is frozen at first sizing; only the bounds move.
    fn resize(&mut self, width: f32, height: f32) {
        self.width = width;
        self.height = height;
    }

    fn update(&mut self, dt: f32) {
        self.time += dt;
        // Wrap time to prevent floating point precision issues
        if self.time > 10000.0 {
            self.time -= 10000.0;
            self.next_wave -= 10000.0;
            for t in &mut self.pending {
                *t -= 10000.0;
            }
        }

        // Commit the next wave: 1-3 streaks, staggered so they do not fire
        // as one. The following wave is armed from the trigger time, not
        // from the last spawn.
        if self.time >= self.next_wave {
            let burst = 1 + self.rng.usize(0..3);
            for i in 0..burst {
                self.pending
                    .push(self.time + i as f32 * 0.35 + self.rng.f32() * 0.2);
            }
            self.next_wave = self.time + 5.0 + self.rng.f32() * 5.0;
        }

        let now = self.time;
        let mut due = 0;
        self.pending.retain(|&t| {
            if t <= now {
                due += 1;
                false
            } else {
                true
            }
        });
        for _ in 0..due {
            self.spawn_shooting();
        }

        for star in &mut self.stars {
            star.blink += dt * star.speed;
        }

        let (w, h) = (self.width, self.height);
        self.shooting.retain_mut(|s| {
            s.life += dt;
            s.x += s.dx * s.speed * dt * 0.6;
            s.y += s.dy * s.speed * dt * 0.6;

            s.life <= s.ttl
                && s.x >= -OFFSCREEN_MARGIN
                && s.x <= w + OFFSCREEN_MARGIN
                && s.y <= h + OFFSCREEN_MARGIN
        });
    }

    fn spawn_shooting(&mut self) {
        let side = self.rng.usize(0..4);
        self.spawn_from_side(side);
    }

    // Streaks enter near the upper corners or upper side edges and rake
    // down across the sky; the direction vector is fixed per region.
    fn spawn_from_side(&mut self, side: usize) {
        let (w, h) = (self.width, self.height);
        let (x, y, dx, dy) = match side {
            0 => (self.rng.f32() * w * 0.18, self.rng.f32() * h * 0.18, 1.0, 1.6),
            1 => (w - self.rng.f32() * w * 0.18, self.rng.f32() * h * 0.18, -1.0, 1.6),
            2 => (self.rng.f32() * w * 0.12, self.rng.f32() * h * 0.35, 1.0, 1.2),
            _ => (w - self.rng.f32() * w * 0.12, self.rng.f32() * h * 0.35, -1.0, 1.2),
        };

        self.shooting.push_back(ShootingStar {
            x,
            y,
            dx,
            dy,
            len: 160.0 + self.rng.f32() * 200.0,
            speed: 900.0 + self.rng.f32() * 700.0,
            life: 0.0,
            ttl: 1.2 + self.rng.f32() * 1.2,
        });

        // Oldest streak goes first when over capacity
        while self.shooting.len() > MAX_SHOOTING {
            self.shooting.pop_front();
        }
    }
}

pub struct AstroEffect {
    width: usize,
    height: usize,
    scene: Scene,
    output_buf: Vec<u8>,
}

impl AstroEffect {
    fn with_rng(width: usize, height: usize, rng: fastrand::Rng) -> Self {
        Self {
            width,
            height,
            scene: Scene::new(width as f32 * CELL_PX, height as f32 * CELL_PX, rng),
            output_buf: Vec::with_capacity(width * height * 25),
        }
    }

    fn paint(&self, glow: &mut [f32]) {
        let cols = self.width as i32;
        let rows = self.height as i32;

        for star in &self.scene.stars {
            let x = (star.x / CELL_PX) as i32;
            let y = (star.y / CELL_PX) as i32;
            if x < 0 || x >= cols || y < 0 || y >= rows {
                continue;
            }
            // Sub-cell radius folds into brightness
            let intensity = star.alpha() * (0.4 + 0.6 * (star.r / 1.7));
            let idx = y as usize * self.width + x as usize;
            glow[idx] = glow[idx].max(intensity);
        }

        for s in &self.scene.shooting {
            let hx = s.x / CELL_PX;
            let hy = s.y / CELL_PX;
            let tx = (s.x - s.dx * s.len) / CELL_PX;
            let ty = (s.y - s.dy * s.len) / CELL_PX;

            // Tail gradient: 0.9 at the head, 0.25 at the midpoint, gone
            // at the tip
            let steps = (tx - hx).abs().max((ty - hy).abs()).ceil().max(1.0) as usize;
            for i in 0..=steps {
                let t = i as f32 / steps as f32;
                let x = (hx + (tx - hx) * t) as i32;
                let y = (hy + (ty - hy) * t) as i32;
                if x < 0 || x >= cols || y < 0 || y >= rows {
                    continue;
                }
                let a = if t < 0.5 {
                    0.9 + (0.25 - 0.9) * (t * 2.0)
                } else {
                    0.25 * (1.0 - (t - 0.5) * 2.0)
                };
                let idx = y as usize * self.width + x as usize;
                glow[idx] = glow[idx].max(a);
            }

            // Bright head with a faint halo
            let cx = hx as i32;
            let cy = hy as i32;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let nx = cx + dx;
                    let ny = cy + dy;
                    if nx < 0 || nx >= cols || ny < 0 || ny >= rows {
                        continue;
                    }
                    let intensity = if dx == 0 && dy == 0 { 0.98 } else { 0.3 };
                    let idx = ny as usize * self.width + nx as usize;
                    glow[idx] = glow[idx].max(intensity);
                }
            }
        }
    }

    fn shade(intensity: f32, bg: (u8, u8, u8)) -> (u8, u8, u8) {
        if intensity < 0.02 {
            return bg;
        }

        // Blend white over the background
        let a = intensity.min(1.0);
        (
            (bg.0 as f32 + (255.0 - bg.0 as f32) * a) as u8,
            (bg.1 as f32 + (255.0 - bg.1 as f32) * a) as u8,
            (bg.2 as f32 + (255.0 - bg.2 as f32) * a) as u8,
        )
    }
}

impl Effect for AstroEffect {
    fn new(width: usize, height: usize) -> Self {
        let rng = match crate::get_seed() {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self::with_rng(width, height, rng)
    }

    fn update(&mut self, dt: f32) {
        self.scene.update(dt);
    }

    fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.output_buf = Vec::with_capacity(width * height * 25);
        self.scene
            .resize(width as f32 * CELL_PX, height as f32 * CELL_PX);
    }

    fn render(&mut self, stdout: &mut BufWriter<Stdout>) -> std::io::Result<()> {
        self.output_buf.clear();
        self.output_buf.extend_from_slice(b"\x1b[H");

        let bg = crate::get_bg_color();
        let mut glow = vec![0.0f32; self.width * self.height];
        self.paint(&mut glow);

        let mut prev_top: (u8, u8, u8) = (255, 255, 255);
        let mut prev_bot: (u8, u8, u8) = (255, 255, 255);

        // Render using half-blocks
        for y in (0..self.height).step_by(2) {
            for x in 0..self.width {
                let top = Self::shade(glow[y * self.width + x], bg);
                let bot = if y + 1 < self.height {
                    Self::shade(glow[(y + 1) * self.width + x], bg)
                } else {
                    bg
                };

                if top != prev_top {
                    write!(
                        self.output_buf,
                        "\x1b[48;2;{};{};{}m",
                        top.0, top.1, top.2
                    )?;
                    prev_top = top;
                }
                if bot != prev_bot {
                    write!(
                        self.output_buf,
                        "\x1b[38;2;{};{};{}m",
                        bot.0, bot.1, bot.2
                    )?;
                    prev_bot = bot;
                }

                self.output_buf.extend_from_slice("▄".as_bytes());
            }
            self.output_buf.extend_from_slice(b"\x1b[0m");
            prev_top = (255, 255, 255);
            prev_bot = (255, 255, 255);
            if y + 2 < self.height {
                self.output_buf.extend_from_slice(b"\r\n");
            }
        }

        stdout.write_all(&self.output_buf)?;
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{PI, TAU};

    const DT: f32 = 1.0 / 60.0;

    fn test_star(blink: f32) -> Star {
        Star {
            x: 0.0,
            y: 0.0,
            r: 1.0,
            blink,
            speed: 1.0,
        }
    }

    fn test_streak(x: f32, y: f32, dx: f32, dy: f32, speed: f32, ttl: f32) -> ShootingStar {
        ShootingStar {
            x,
            y,
            dx,
            dy,
            len: 200.0,
            speed,
            life: 0.0,
            ttl,
        }
    }

    #[test]
    fn star_count_scales_with_viewport_area() {
        let scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(42));
        assert_eq!(scene.stars.len(), 8);

        let scene = Scene::new(1920.0, 1080.0, fastrand::Rng::with_seed(42));
        assert_eq!(scene.stars.len(), 17);

        // Too small a sky for even one star
        let scene = Scene::new(200.0, 100.0, fastrand::Rng::with_seed(42));
        assert!(scene.stars.is_empty());
    }

    #[test]
    fn stars_sampled_inside_viewport_and_ranges() {
        let scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(7));
        for star in &scene.stars {
            assert!(star.x >= 0.0 && star.x < 1200.0);
            assert!(star.y >= 0.0 && star.y < 800.0);
            assert!((0.4..1.7).contains(&star.r));
            assert!((0.6..2.2).contains(&star.speed));
            assert!((0.0..TAU).contains(&star.blink));
        }
    }

    #[test]
    fn star_alpha_stays_in_pulse_band() {
        let mut star = test_star(0.0);
        star.speed = 2.2;
        for _ in 0..2000 {
            star.blink += DT * star.speed;
            let a = star.alpha();
            assert!((0.35..=1.0).contains(&a), "alpha out of band: {a}");
        }
    }

    #[test]
    fn star_alpha_is_periodic_in_phase() {
        let a = test_star(0.7).alpha();
        let b = test_star(0.7 + PI).alpha();
        assert!((a - b).abs() < 1e-4);
    }

    #[test]
    fn spawn_regions_fix_direction_per_side() {
        let mut scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(3));

        scene.spawn_from_side(0);
        let s = scene.shooting.back().unwrap();
        assert_eq!((s.dx, s.dy), (1.0, 1.6));
        assert!(s.x >= 0.0 && s.x < 216.0);
        assert!(s.y >= 0.0 && s.y < 144.0);
        assert!((160.0..360.0).contains(&s.len));
        assert!((900.0..1600.0).contains(&s.speed));
        assert!((1.2..2.4).contains(&s.ttl));
        assert_eq!(s.life, 0.0);

        scene.spawn_from_side(1);
        let s = scene.shooting.back().unwrap();
        assert_eq!((s.dx, s.dy), (-1.0, 1.6));
        assert!(s.x > 984.0 && s.x <= 1200.0);
        assert!(s.y >= 0.0 && s.y < 144.0);

        scene.spawn_from_side(2);
        let s = scene.shooting.back().unwrap();
        assert_eq!((s.dx, s.dy), (1.0, 1.2));
        assert!(s.x >= 0.0 && s.x < 144.0);
        assert!(s.y >= 0.0 && s.y < 280.0);

        scene.spawn_from_side(3);
        let s = scene.shooting.back().unwrap();
        assert_eq!((s.dx, s.dy), (-1.0, 1.2));
        assert!(s.x > 1056.0 && s.x <= 1200.0);
        assert!(s.y >= 0.0 && s.y < 280.0);
    }

    #[test]
    fn shooting_cap_evicts_oldest_first() {
        let mut scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(9));
        for _ in 0..4 {
            scene.spawn_from_side(0);
        }
        assert_eq!(scene.shooting.len(), 4);

        let second = scene.shooting[1].clone();
        scene.spawn_from_side(1);
        assert_eq!(scene.shooting.len(), 4);
        assert_eq!(scene.shooting[0], second);
    }

    #[test]
    fn streak_expires_by_ttl_while_on_screen() {
        let mut scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(1));
        // Slow enough to stay well inside the viewport
        scene
            .shooting
            .push_back(test_streak(600.0, 400.0, 1.0, 1.2, 10.0, 1.2));

        scene.update(0.5);
        scene.update(0.5);
        assert_eq!(scene.shooting.len(), 1);

        scene.update(0.5);
        assert!(scene.shooting.is_empty());
    }

    #[test]
    fn streak_culled_past_trailing_edge() {
        let mut scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(1));
        scene
            .shooting
            .push_back(test_streak(1390.0, 100.0, 1.0, 0.0, 1000.0, 10.0));

        // x = 1390 + 1000 * 0.1 * 0.6 = 1450 > 1200 + 200
        scene.update(0.1);
        assert!(scene.shooting.is_empty());
    }

    #[test]
    fn no_cull_above_top_edge() {
        let mut scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(1));
        scene
            .shooting
            .push_back(test_streak(600.0, -500.0, 1.0, 1.6, 0.0, 10.0));

        scene.update(0.1);
        assert_eq!(scene.shooting.len(), 1);
    }

    #[test]
    fn wave_fires_staggered_burst_and_rearms_once() {
        // Viewport large enough that nothing is culled mid-burst
        let mut scene = Scene::new(12_000.0, 8_000.0, fastrand::Rng::with_seed(5));
        let first = scene.next_wave;
        assert!((5.0..10.0).contains(&first));

        while scene.time < first {
            scene.update(DT);
        }
        let trigger = scene.time;
        let rearmed = scene.next_wave;
        assert!(rearmed >= trigger + 5.0 && rearmed < trigger + 10.0);

        let burst = scene.pending.len() + scene.shooting.len();
        assert!((1..=3).contains(&burst));

        // Worst-case stagger is 0.35 * 2 + 0.2 seconds
        while scene.time < trigger + 1.1 {
            scene.update(DT);
        }
        assert!(scene.pending.is_empty());
        assert_eq!(scene.shooting.len(), burst);
        assert_eq!(scene.next_wave, rearmed);
    }

    #[test]
    fn resize_moves_bounds_but_not_stars() {
        let mut scene = Scene::new(1200.0, 800.0, fastrand::Rng::with_seed(8));
        let before: Vec<(f32, f32)> = scene.stars.iter().map(|s| (s.x, s.y)).collect();

        scene.resize(2400.0, 1600.0);
        assert_eq!(scene.width, 2400.0);
        assert_eq!(scene.height, 1600.0);

        let after: Vec<(f32, f32)> = scene.stars.iter().map(|s| (s.x, s.y)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn paint_lights_star_cells() {
        // 80 x 48 half-cells -> 1280 x 768 virtual px -> 8 stars
        let effect = AstroEffect::with_rng(80, 48, fastrand::Rng::with_seed(11));
        assert_eq!(effect.scene.stars.len(), 8);

        let mut glow = vec![0.0f32; 80 * 48];
        effect.paint(&mut glow);

        for star in &effect.scene.stars {
            let idx = (star.y / CELL_PX) as usize * 80 + (star.x / CELL_PX) as usize;
            assert!(glow[idx] > 0.0);
        }
    }

    #[test]
    fn paint_draws_head_and_fading_tail() {
        let mut effect = AstroEffect::with_rng(80, 48, fastrand::Rng::with_seed(2));
        effect.scene.stars.clear();
        effect.scene.shooting.push_back(ShootingStar {
            x: 640.0,
            y: 384.0,
            dx: 1.0,
            dy: 1.6,
            len: 320.0,
            speed: 900.0,
            life: 0.0,
            ttl: 2.0,
        });

        let mut glow = vec![0.0f32; 80 * 48];
        effect.paint(&mut glow);

        let head = (384.0 / CELL_PX) as usize * 80 + (640.0 / CELL_PX) as usize;
        assert!(glow[head] >= 0.98);

        // Midpoint of the tail sits at a quarter intensity
        let mx = ((640.0 - 160.0) / CELL_PX) as usize;
        let my = ((384.0 - 1.6 * 160.0) / CELL_PX) as usize;
        assert!((glow[my * 80 + mx] - 0.25).abs() < 1e-3);
    }
}
