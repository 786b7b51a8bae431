//! ledcast preview viewer.
//!
//! Maps a cast's preview slot and renders it in an SDL2 window. Runs
//! as its own OS process so window-toolkit constraints never touch the
//! cast loop; the only channel back is the slot's flag word:
//!
//!   q / Escape   ask the cast to stop
//!   p            close the preview (cast keeps running)
//!   t            disable the text overlay

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::rect::Point;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lc_protocol::slot::{slot_path, FLAG_PREVIEW_OFF, FLAG_STOP, FLAG_TEXT_OFF};
use lc_protocol::FrameSlot;

const GRID_COLOR: Color = Color::RGB(0xee, 0xee, 0xee);
const BG: Color = Color::RGB(0x0d, 0x0d, 0x0d);

/// How long to wait for the cast to allocate the slot.
const SLOT_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "lc-viewer", about = "ledcast preview window")]
struct Args {
    /// Cast name whose preview slot to display
    name: String,

    /// Window width (defaults to the slot's frame width)
    #[arg(long)]
    width: Option<u32>,

    /// Window height (defaults to the slot's frame height)
    #[arg(long)]
    height: Option<u32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let path = slot_path(&args.name);
    let mut slot = wait_for_slot(&path)?;
    info!(name = %args.name, "attached to preview slot");

    let win_w = args.width.unwrap_or_else(|| slot.width().max(160));
    let win_h = args.height.unwrap_or_else(|| slot.height().max(90));
    let title = format!("ledcast preview: {}", slot.title());

    let sdl = sdl2::init().map_err(|e| anyhow!(e))?;
    let video = sdl.video().map_err(|e| anyhow!(e))?;
    let window = video
        .window(&title, win_w, win_h)
        .position_centered()
        .resizable()
        .build()
        .context("window creation failed")?;
    let mut canvas = window
        .into_canvas()
        .accelerated()
        .present_vsync()
        .build()
        .context("canvas creation failed")?;
    let texture_creator = canvas.texture_creator();
    let mut event_pump = sdl.event_pump().map_err(|e| anyhow!(e))?;

    let mut texture = None;
    let mut tex_dims = (0u32, 0u32);
    let mut last_seq = 0u64;
    let mut shown = 0u64;
    let mut title_refresh = Instant::now();

    'main: loop {
        for event in event_pump.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    keycode: Some(Keycode::Escape | Keycode::Q),
                    ..
                } => {
                    slot.set_flag(FLAG_STOP);
                    info!("stop requested");
                    break 'main;
                }
                Event::KeyDown {
                    keycode: Some(Keycode::P),
                    ..
                } => {
                    slot.set_flag(FLAG_PREVIEW_OFF);
                    info!("preview close requested");
                    break 'main;
                }
                Event::KeyDown {
                    keycode: Some(Keycode::T),
                    ..
                } => {
                    slot.set_flag(FLAG_TEXT_OFF);
                    info!("text overlay disabled");
                }
                _ => {}
            }
        }

        // The cast unlinks the slot file on Closing.
        if !path.exists() {
            info!("preview slot gone, exiting");
            break;
        }

        if let Some(frame) = slot.get_frame() {
            if frame.seq != last_seq {
                last_seq = frame.seq;
                shown += 1;

                if tex_dims != (frame.width, frame.height) {
                    texture = Some(
                        texture_creator
                            .create_texture_streaming(
                                PixelFormatEnum::RGB24,
                                frame.width,
                                frame.height,
                            )
                            .context("texture creation failed")?,
                    );
                    tex_dims = (frame.width, frame.height);
                }

                if let Some(texture) = texture.as_mut() {
                    texture
                        .update(None, &frame.data, frame.width as usize * 3)
                        .context("texture update failed")?;
                    canvas.set_draw_color(BG);
                    canvas.clear();
                    canvas.copy(texture, None, None).map_err(|e| anyhow!(e))?;
                    let (grid, tiles_x, tiles_y) = slot.grid();
                    if grid {
                        draw_grid(&mut canvas, tiles_x as u32, tiles_y as u32)
                            .map_err(|e| anyhow!(e))?;
                    }
                    canvas.present();
                }
            }
        }

        if title_refresh.elapsed() >= Duration::from_secs(1) {
            title_refresh = Instant::now();
            let title = format!(
                "ledcast preview: {} | {} fps target | frame {}",
                slot.title(),
                slot.fps(),
                shown
            );
            let _ = canvas.window_mut().set_title(&title);
        }

        std::thread::sleep(Duration::from_millis(15));
    }
    Ok(())
}

/// Tile boundaries of a multicast grid, drawn over the scaled frame.
fn draw_grid(
    canvas: &mut sdl2::render::WindowCanvas,
    tiles_x: u32,
    tiles_y: u32,
) -> Result<(), String> {
    if tiles_x < 2 && tiles_y < 2 {
        return Ok(());
    }
    let (w, h) = canvas.output_size()?;
    canvas.set_draw_color(GRID_COLOR);
    for tx in 1..tiles_x {
        let x = (w * tx / tiles_x) as i32;
        canvas.draw_line(Point::new(x, 0), Point::new(x, h as i32))?;
    }
    for ty in 1..tiles_y {
        let y = (h * ty / tiles_y) as i32;
        canvas.draw_line(Point::new(0, y), Point::new(w as i32, y))?;
    }
    Ok(())
}

fn wait_for_slot(path: &Path) -> Result<FrameSlot> {
    let deadline = Instant::now() + SLOT_WAIT;
    loop {
        match FrameSlot::open(path) {
            Ok(slot) => return Ok(slot),
            Err(e) if Instant::now() >= deadline => {
                return Err(anyhow!("no preview slot at {}: {e}", path.display()));
            }
            Err(_) => std::thread::sleep(Duration::from_millis(250)),
        }
    }
}
